use std::{
    io::Write,
    net::ToSocketAddrs,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use mesh_wire::{ConnectFlags, ConnectMsg};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    conn::sockopt,
    gossip,
    hooks::TlsPolicy,
    mesh::MeshInner,
    peer::Peer,
    subnet,
    timing::sleep_unless,
};

/// Poll budget for the non-blocking connect.
const CONNECT_WAIT: Duration = Duration::from_millis(100);

/// Upper bound of the thundering-herd jitter before each dial.
const DIAL_JITTER_MS: u64 = 5_000;

/// The per-peer connect thread. Runs for as long as the peer exists: dials
/// while there is no socket, otherwise sits back as a 1 s keep-alive check.
pub(crate) fn connect_loop(mesh: &Arc<MeshInner>, peer: &Arc<Peer>) {
    let stop = || mesh.exiting() || peer.decom.load(Ordering::Acquire);

    while !stop() {
        if !peer.ready_to_dial() {
            sleep_unless(Duration::from_secs(1), stop);
            continue;
        }

        let jitter = rand::rng().random_range(0..DIAL_JITTER_MS);
        sleep_unless(Duration::from_millis(jitter), stop);
        if stop() || !peer.ready_to_dial() {
            continue;
        }

        if let Some((sock, target, subnet_idx)) = dial_once(mesh, peer) {
            let (rd, wr) = match (sock.try_clone(), sock.try_clone()) {
                (Ok(rd), Ok(wr)) => (rd, wr),
                _ => {
                    warn!(peer = %peer.name, "could not clone fresh socket");
                    continue;
                }
            };
            match peer.install_sock(sock, subnet_idx) {
                Ok(()) => {
                    mesh.spawn_workers(peer, rd, wr);
                    if gossip::send_hello(mesh, peer, false).is_err() {
                        debug!(peer = %peer.name, "hello enqueue on fresh socket failed");
                    }
                    info!(peer = %peer.name, via = %target, "mesh connection established");
                }
                // the accept path installed a socket while we dialed
                Err(stale) => drop(stale),
            }
        }
    }

    peer.state.lock().have_connect_thread = false;
    debug!(peer = %peer.name, "connect thread exiting");
}

/// One dial attempt: subnet pick, port resolution, bounded connect, socket
/// options, connect record, optional TLS. Any failure returns None and the
/// loop re-sleeps.
fn dial_once(
    mesh: &Arc<MeshInner>,
    peer: &Arc<Peer>,
) -> Option<(std::net::TcpStream, String, Option<usize>)> {
    if let Some(up) = mesh.hook_machine_up() {
        if !up(&peer.name) {
            debug!(peer = %peer.name, "machine reported down, skipping dial");
            return None;
        }
    }
    let base = mesh.dial_name(&peer.name);
    let (target, subnet_idx) = subnet::next_dial_target(&base);

    let port = mesh.resolve_peer_port(peer)?;
    let addr = match (target.as_str(), port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next()?,
        Err(err) => {
            debug!(peer = %peer.name, %target, %err, "address resolution failed");
            return None;
        }
    };

    let sock = match sockopt::connect_bounded(addr, CONNECT_WAIT) {
        Ok(sock) => sock,
        Err(err) => {
            debug!(peer = %peer.name, %target, %err, "dial failed");
            return None;
        }
    };
    if let Err(err) = sockopt::set_mesh_sockopts(&sock, mesh.tunables.sock_buf_size()) {
        debug!(peer = %peer.name, %err, "sockopts failed");
        return None;
    }
    sockopt::set_linger_zero(&sock);

    let want_tls = mesh.cfg.tls_policy == TlsPolicy::Require;
    let msg = ConnectMsg {
        to_host: peer.name.to_string(),
        to_port: port,
        to_netnum: mesh.netnum,
        flags: if want_tls { ConnectFlags::TLS } else { ConnectFlags::empty() },
        from_host: mesh.my_name().to_owned(),
        from_port: mesh.my_port(),
        from_netnum: mesh.netnum,
    };
    let mut buf = Vec::new();
    if msg.encode(&mut buf).is_err() {
        return None;
    }
    if let Err(err) = (&sock).write_all(&buf) {
        debug!(peer = %peer.name, %err, "connect record write failed");
        return None;
    }

    if want_tls {
        let Some(tls) = mesh.hook_tls() else {
            warn!(peer = %peer.name, "tls required but no hook registered");
            return None;
        };
        if let Err(err) = tls.connect(&sock, &peer.name) {
            warn!(peer = %peer.name, %err, "tls connect failed");
            return None;
        }
    }

    peer.set_port(port);
    Some((sock, target, subnet_idx))
}
