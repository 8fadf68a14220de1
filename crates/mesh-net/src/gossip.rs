//! The hello ("gossip") exchange.
//!
//! Both ends of a fresh connection send a hello carrying their full known
//! peer list. A receiver only ever adds peers, kicks off connect threads
//! for the new ones, and marks the sender hello-complete, which is the gate
//! for user-message sends. A node therefore only needs a seed list with any
//! one existing member to learn the whole cluster.

use std::{io::Read, sync::atomic::Ordering, sync::Arc};

use mesh_wire::{encode_hello, read_hello, FrameType, HelloPeer, WireError};
use tracing::{debug, info};

use crate::{error::SendError, mesh::MeshInner, peer::Peer, queue::EnqueueFlags};

/// Snapshot the peer table as a hello payload. Includes ourselves; the
/// remote side skips its own name.
fn build_peer_list(mesh: &MeshInner) -> Vec<HelloPeer> {
    let table = mesh.table.read();
    table
        .iter()
        .map(|p| HelloPeer { host: p.name.to_string(), port: p.port() })
        .collect()
}

/// Enqueue a hello (or hello-reply) on `peer`. Hello bypasses the
/// got-hello gate and the queue caps; it must go out on a socket that
/// carries nothing else yet.
pub(crate) fn send_hello(
    mesh: &Arc<MeshInner>,
    peer: &Arc<Peer>,
    reply: bool,
) -> Result<(), SendError> {
    let peers = build_peer_list(mesh);
    let mut body = Vec::new();
    encode_hello(&mut body, &peers).map_err(|_| SendError::Internal)?;
    let typ = if reply { FrameType::HelloReply } else { FrameType::Hello };
    mesh.enqueue_control(peer, typ, &body, EnqueueFlags::NO_LIMIT | EnqueueFlags::NO_DELAY)
}

/// Reader-side hello processing: integrate the advertised peers and open
/// the user-send gate for the sender. A plain hello gets a hello-reply
/// after processing.
pub(crate) fn handle_hello<R: Read>(
    mesh: &Arc<MeshInner>,
    from: &Arc<Peer>,
    input: &mut R,
    wants_reply: bool,
) -> Result<(), WireError> {
    let peers = read_hello(input)?;
    debug!(peer = %from.name, advertised = peers.len(), "hello received");

    for entry in &peers {
        let name = entry.host.to_ascii_lowercase();
        if name == mesh.my_name() {
            continue;
        }
        let _ = mesh.ensure_peer(&name, entry.port);
    }

    if !from.got_hello.swap(true, Ordering::AcqRel) {
        info!(peer = %from.name, "peer hello complete, user sends open");
    }
    if let Some(hook) = mesh.hook_hello() {
        hook(&from.name);
    }
    if wants_reply {
        if let Err(err) = send_hello(mesh, from, true) {
            debug!(peer = %from.name, ?err, "hello-reply enqueue failed");
        }
    }
    Ok(())
}
