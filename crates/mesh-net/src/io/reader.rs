use std::{
    io::{BufReader, Read},
    net::TcpStream,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};

use mesh_wire::{AckMsg, Envelope, FrameType, UserMsgHeader, WireError};
use tracing::{debug, warn};

use crate::{
    ack::AckHandle,
    gossip,
    hooks::HandlerCtx,
    mesh::MeshInner,
    peer::{Peer, Worker},
};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Per-socket reader thread: parse one envelope at a time and dispatch by
/// frame type. Any I/O or protocol error tears the connection down; the
/// dial thread reconnects.
pub(crate) fn reader_loop(mesh: &Arc<MeshInner>, peer: &Arc<Peer>, sock: TcpStream) {
    let mut input = BufReader::with_capacity(READ_BUF_SIZE, sock);
    let mut scratch: Vec<u8> = Vec::new();

    loop {
        if mesh.exiting() || peer.is_closing() || peer.decom.load(Ordering::Acquire) {
            break;
        }
        match read_one(mesh, peer, &mut input, &mut scratch) {
            Ok(()) => {
                peer.distress.store(0, Ordering::Relaxed);
            }
            Err(err) => {
                // only the first failure of a streak is worth a line
                let streak = peer.distress.fetch_add(1, Ordering::Relaxed);
                if peer.is_closing() || mesh.exiting() {
                    debug!(peer = %peer.name, "reader unblocked by shutdown");
                } else if streak == 0 {
                    warn!(peer = %peer.name, %err, "read failed, closing connection");
                } else {
                    debug!(peer = %peer.name, %err, streak, "read failed again");
                }
                break;
            }
        }
    }

    peer.close_sock();
    if peer.worker_exited(Worker::Reader) {
        mesh.on_socket_released(peer);
    }
    debug!(peer = %peer.name, "reader thread exiting");
}

fn read_one<R: Read>(
    mesh: &Arc<MeshInner>,
    peer: &Arc<Peer>,
    input: &mut R,
    scratch: &mut Vec<u8>,
) -> Result<(), WireError> {
    let env = Envelope::read_from(input)?;
    peer.touch_rx();

    match env.typ {
        FrameType::Heartbeat => {}
        FrameType::Hello => gossip::handle_hello(mesh, peer, input, true)?,
        FrameType::HelloReply => gossip::handle_hello(mesh, peer, input, false)?,
        FrameType::DecomName => {
            let name = mesh_wire::read_decom_name(input)?;
            debug!(peer = %peer.name, decom = %name, "decom-by-name received");
            mesh.decom_peer(&name);
        }
        FrameType::UserMsg => handle_user_msg(mesh, peer, input, scratch)?,
        FrameType::Ack | FrameType::AckPayload => {
            let ack = AckMsg::read_from(input, env.typ == FrameType::AckPayload)?;
            let woke = {
                let mut waiters = peer.waiters.lock();
                waiters.complete(ack.seqnum, ack.outrc, ack.payload)
            };
            if woke {
                peer.ack_wake.notify_all();
            } else {
                debug!(peer = %peer.name, seqnum = ack.seqnum, "ack with no waiter");
            }
        }
    }
    Ok(())
}

fn handle_user_msg<R: Read>(
    mesh: &Arc<MeshInner>,
    peer: &Arc<Peer>,
    input: &mut R,
    scratch: &mut Vec<u8>,
) -> Result<(), WireError> {
    let hdr = UserMsgHeader::read_from(input)?;
    let len = hdr.datalen as usize;
    if len > mesh.tunables.max_body() {
        return Err(WireError::BadBodyLen(hdr.datalen as i32));
    }

    // reuse the per-connection scratch buffer when the body fits its cap;
    // oversized bodies get a one-off allocation instead of growing it
    let body: &[u8] = if len <= mesh.tunables.user_msg_buf() {
        if scratch.len() < len {
            scratch.resize(len, 0);
        }
        input.read_exact(&mut scratch[..len])?;
        &scratch[..len]
    } else {
        let mut big = vec![0u8; len];
        input.read_exact(&mut big)?;
        scratch.clear();
        *scratch = big;
        &scratch[..]
    };

    if let Some(qstat) = mesh.hook_qstat() {
        qstat.reader(&peer.name, FrameType::UserMsg as i32, len);
    }
    peer.stats.add_rx((mesh_wire::USER_MSG_HEADER_LEN + len) as u64);

    let Some(handler) = mesh.handler(hdr.usertype) else {
        debug!(
            peer = %peer.name,
            usertype = hdr.usertype,
            "user message with no registered handler"
        );
        return Ok(());
    };

    let ack = hdr
        .waitforack
        .then(|| AckHandle::new(mesh.clone(), peer.clone(), hdr.seqnum));
    let mut ctx = HandlerCtx {
        from: &peer.name,
        from_id: peer.id,
        usertype: hdr.usertype,
        body,
        ack,
    };

    peer.running_user_func.store(true, Ordering::Release);
    let t0 = Instant::now();
    // a panicking handler must not take the reader's bookkeeping with it
    let outcome =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (handler.func)(&mut ctx)));
    handler.record_call(t0.elapsed().as_micros() as u64);
    peer.running_user_func.store(false, Ordering::Release);
    if outcome.is_err() {
        warn!(peer = %peer.name, usertype = hdr.usertype, "user handler panicked");
    }
    Ok(())
}
