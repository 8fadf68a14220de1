use std::{
    io::{BufWriter, Write},
    net::TcpStream,
    sync::Arc,
    time::{Duration, Instant},
};

use mesh_wire::rewrite_from;
use tracing::{debug, warn};

use crate::{
    mesh::MeshInner,
    peer::{Peer, Worker},
    queue::EnqueueFlags,
    timing::now_ms,
};

const WRITE_BUF_SIZE: usize = 64 * 1024;

/// A write batch taking this long is worth a log line.
const SLOW_BATCH: Duration = Duration::from_secs(2);

/// Per-socket writer thread. Waits on the write-wakeup condvar (with a poll
/// floor), detaches the whole queue under its mutex, then writes the batch
/// with no lock held so senders never block behind the network.
pub(crate) fn writer_loop(mesh: &Arc<MeshInner>, peer: &Arc<Peer>, sock: TcpStream) {
    let mut out = BufWriter::with_capacity(WRITE_BUF_SIZE, sock);
    let mut broke = false;

    'run: while !broke {
        let batch = {
            let mut q = peer.queue.lock();
            loop {
                if mesh.exiting() || peer.is_closing() {
                    break 'run;
                }
                if !q.is_empty() {
                    break q.detach();
                }
                // nothing pending; make sure buffered bytes hit the wire
                drop(q);
                if out.flush().is_err() {
                    break 'run;
                }
                q = peer.queue.lock();
                if q.is_empty() {
                    let poll = Duration::from_millis(mesh.tunables.writer_poll_ms());
                    let _ = peer.write_wake.wait_for(&mut q, poll);
                }
            }
        };
        // senders blocked on the throttle can refill now
        peer.throttle_wake.notify_all();

        let t0 = Instant::now();
        let mut flush = false;
        let mut max_age_ms = 0u64;
        let mut wrote = 0u64;
        for mut frame in batch {
            if broke || peer.is_closing() {
                continue; // torn-down connection discards what's left
            }
            if rewrite_from(&mut frame.buf, mesh.my_name(), mesh.my_port()).is_err() {
                broke = true;
                continue;
            }
            if let Err(err) = out.write_all(&frame.buf) {
                warn!(peer = %peer.name, %err, "write failed");
                broke = true;
                continue;
            }
            wrote += frame.buf.len() as u64;
            flush |= frame.flags.contains(EnqueueFlags::NO_DELAY);
            max_age_ms = max_age_ms.max(now_ms().saturating_sub(frame.enq_ms));
        }
        peer.stats.add_tx(wrote);

        if !broke && flush && out.flush().is_err() {
            warn!(peer = %peer.name, "flush failed");
            broke = true;
        }
        let took = t0.elapsed();
        if took >= SLOW_BATCH {
            warn!(peer = %peer.name, ?took, max_age_ms, "slow write batch");
        }
    }

    // exit path: drop whatever is still queued and hand the fd back
    let dropped = {
        let mut q = peer.queue.lock();
        q.clear()
    };
    if dropped > 0 {
        debug!(peer = %peer.name, dropped, "discarding unsent frames");
        if let Some(qstat) = mesh.hook_qstat() {
            qstat.clear(&peer.name);
        }
    }
    peer.throttle_wake.notify_all();
    peer.close_sock();
    if peer.worker_exited(Worker::Writer) {
        mesh.on_socket_released(peer);
    }
    debug!(peer = %peer.name, "writer thread exiting");
}
