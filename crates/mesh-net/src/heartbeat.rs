//! Heartbeat emission and the liveness checker.
//!
//! Two singleton threads per mesh. The sender enqueues a heartbeat to every
//! connected peer with `HEAD | NO_DUPE | NO_DELAY | NO_LIMIT`: it jumps the
//! queue, collapses against a heartbeat already at the head, flushes
//! immediately and ignores backpressure. The checker kills sockets that
//! have gone silent, scans the appsock watchlist, and keeps our name-service
//! registration fresh.

use std::{sync::Arc, time::Duration};

use mesh_wire::FrameType;
use tracing::{debug, error, warn};

use crate::{
    mesh::MeshInner,
    queue::EnqueueFlags,
    subnet,
    timing::{now_ms, sleep_unless, Repeater},
    watchlist,
};

const HEARTBEAT_FLAGS: EnqueueFlags = EnqueueFlags::HEAD
    .union(EnqueueFlags::NO_DUPE)
    .union(EnqueueFlags::NO_DELAY)
    .union(EnqueueFlags::NO_LIMIT);

pub(crate) fn heartbeat_send_loop(mesh: &Arc<MeshInner>) {
    let stop = || mesh.exiting();
    let mut rep = Repeater::every(Duration::from_millis(mesh.tunables.heartbeat_send_ms()));

    while !stop() {
        rep.set_interval(Duration::from_millis(mesh.tunables.heartbeat_send_ms()));
        if rep.fired() {
            let peers: Vec<_> = {
                let table = mesh.table.read();
                table.iter().cloned().collect()
            };
            for peer in peers {
                if peer.name.as_ref() == mesh.my_name() || !peer.connected() {
                    continue;
                }
                if mesh.enqueue_control(&peer, FrameType::Heartbeat, &[], HEARTBEAT_FLAGS).is_err()
                {
                    debug!(peer = %peer.name, "heartbeat enqueue failed");
                }
            }
        }
        sleep_unless(Duration::from_millis(250), stop);
    }
    debug!("heartbeat send thread exiting");
}

pub(crate) fn heartbeat_check_loop(mesh: &Arc<MeshInner>) {
    let stop = || mesh.exiting();
    let mut register = Repeater::every(Duration::from_millis(mesh.tunables.portmux_register_ms()));

    while !stop() {
        check_liveness(mesh);
        watchlist::scan(mesh);

        register.set_interval(Duration::from_millis(mesh.tunables.portmux_register_ms()));
        if register.fired() {
            reregister(mesh);
        }
        sleep_unless(Duration::from_secs(1), stop);
    }
    debug!("heartbeat check thread exiting");
}

/// Kill any socket with no inbound traffic for the check interval. Runs
/// under the mesh read lock; `close_sock` takes only the peer mutex, which
/// is what makes that safe.
fn check_liveness(mesh: &Arc<MeshInner>) {
    let check_ms = mesh.tunables.heartbeat_check_ms();
    let blackout = Duration::from_millis(mesh.tunables.subnet_blackout_ms());
    let now = now_ms();

    let table = mesh.table.read();
    for peer in table.iter() {
        if !peer.connected() || peer.running_user_func.load(std::sync::atomic::Ordering::Acquire) {
            continue;
        }
        let last = peer.last_rx_ms.load(std::sync::atomic::Ordering::Relaxed);
        if last == 0 || now.saturating_sub(last) < check_ms {
            continue;
        }
        warn!(
            peer = %peer.name,
            silent_ms = now.saturating_sub(last),
            "no inbound traffic, killing connection"
        );
        if let Some(idx) = peer.state.lock().last_subnet {
            subnet::mark_bad(idx, blackout);
        }
        peer.close_sock();
    }
}

/// Keep the portmux registration alive. The name service answering with a
/// different port than the one we're listening on means two processes claim
/// the same triple; that is fatal by design.
fn reregister(mesh: &Arc<MeshInner>) {
    let Some(ns) = mesh.hook_name_service() else {
        return;
    };
    let cfg = &mesh.cfg;
    match ns.register(&cfg.app, &cfg.service, &cfg.instance, mesh.my_port()) {
        Ok(port) if port == mesh.my_port() => {}
        Ok(port) => {
            error!(
                ours = mesh.my_port(),
                theirs = port,
                "name service re-registration diverged, aborting"
            );
            std::process::abort();
        }
        Err(err) => warn!(%err, "name service re-registration failed"),
    }
}
