use std::{
    net::{Shutdown, TcpStream},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{ack::WaitList, queue::SendQueue, stats::PeerCounters, timing::now_ms};

/// Stable, O(1) handle for a peer. Identity survives reconnects; ids are
/// never reused within a mesh lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) u32);

impl PeerId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Socket and worker lifecycle, guarded by the peer mutex.
///
/// At most one connect thread, one reader and one writer exist per peer.
/// `really_closed` (socket fully released) is distinct from `closed`
/// (shutdown initiated): the fd is only dropped once both worker flags are
/// clear.
pub(crate) struct PeerState {
    pub sock: Option<TcpStream>,
    pub closed: bool,
    pub really_closed: bool,
    pub have_connect_thread: bool,
    pub have_reader_thread: bool,
    pub have_writer_thread: bool,
    /// Suffix index the live socket was dialed through; None for accepted
    /// sockets and bare-name dials.
    pub last_subnet: Option<usize>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            sock: None,
            closed: false,
            really_closed: true,
            have_connect_thread: false,
            have_reader_thread: false,
            have_writer_thread: false,
            last_subnet: None,
        }
    }
}

pub(crate) enum Worker {
    Reader,
    Writer,
}

/// One known peer. Owned by the peer table; threads hold `Arc`s so a decom
/// can splice the entry out while workers drain.
pub(crate) struct Peer {
    pub id: PeerId,
    /// Canonical (ASCII-lowercased) hostname.
    pub name: Box<str>,
    /// Advertised TCP port. Zero means resolve through the name service on
    /// each dial; updated when a connect or hello teaches us better.
    pub port: AtomicU32,

    pub state: Mutex<PeerState>,
    /// Mirrors `state.closed` so hot paths can check without the mutex.
    closed: AtomicBool,

    pub queue: Mutex<SendQueue>,
    pub write_wake: Condvar,

    pub waiters: Mutex<WaitList>,
    pub ack_wake: Condvar,

    pub throttle: Mutex<()>,
    pub throttle_wake: Condvar,

    /// Milliseconds (process epoch) of the last inbound byte; zero until
    /// the first one.
    pub last_rx_ms: AtomicU64,
    pub got_hello: AtomicBool,
    pub decom: AtomicBool,
    /// Suppresses the liveness kill while a handler runs.
    pub running_user_func: AtomicBool,
    /// Consecutive reader failures since the last good frame; throttles log
    /// spam only.
    pub distress: AtomicU32,
    /// Counts user sends toward the periodic no-delay promotion.
    pub sends_since_flush: AtomicU32,

    pub stats: PeerCounters,
}

impl Peer {
    pub(crate) fn new(id: PeerId, name: Box<str>, port: u16) -> Self {
        Self {
            id,
            name,
            port: AtomicU32::new(u32::from(port)),
            state: Mutex::new(PeerState::new()),
            closed: AtomicBool::new(true),
            queue: Mutex::new(SendQueue::default()),
            write_wake: Condvar::new(),
            waiters: Mutex::new(WaitList::default()),
            ack_wake: Condvar::new(),
            throttle: Mutex::new(()),
            throttle_wake: Condvar::new(),
            last_rx_ms: AtomicU64::new(0),
            got_hello: AtomicBool::new(false),
            decom: AtomicBool::new(false),
            running_user_func: AtomicBool::new(false),
            distress: AtomicU32::new(0),
            sends_since_flush: AtomicU32::new(0),
            stats: PeerCounters::default(),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed) as u16
    }

    pub(crate) fn set_port(&self, port: u16) {
        if port != 0 {
            self.port.store(u32::from(port), Ordering::Relaxed);
        }
    }

    /// Socket present and not shutting down.
    pub(crate) fn connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn touch_rx(&self) {
        self.last_rx_ms.store(now_ms().max(1), Ordering::Relaxed);
    }

    /// Install a fresh socket. Fails (returning the socket back) if one is
    /// already present.
    pub(crate) fn install_sock(
        &self,
        sock: TcpStream,
        last_subnet: Option<usize>,
    ) -> Result<(), TcpStream> {
        let mut st = self.state.lock();
        if st.sock.is_some() {
            return Err(sock);
        }
        st.sock = Some(sock);
        st.closed = false;
        st.really_closed = false;
        st.last_subnet = last_subnet;
        st.have_reader_thread = true;
        st.have_writer_thread = true;
        self.closed.store(false, Ordering::Release);
        // a silent-from-birth socket must still trip the liveness check
        self.touch_rx();
        Ok(())
    }

    /// Initiate shutdown of the live socket, waking any blocked reader or
    /// writer. Idempotent.
    ///
    /// Takes only the peer mutex, never the mesh lock; the liveness checker
    /// calls this while holding the mesh read lock and relies on that.
    pub(crate) fn close_sock(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        self.closed.store(true, Ordering::Release);
        if let Some(sock) = &st.sock {
            let _ = sock.shutdown(Shutdown::Both);
            debug!(peer = %self.name, "socket shutdown initiated");
        }
        drop(st);
        // unblock everyone parked on this peer
        self.write_wake.notify_all();
        self.waiters.lock().fail_all();
        self.ack_wake.notify_all();
        self.throttle_wake.notify_all();
    }

    /// Worker exit: clear the flag and release the fd once both are gone.
    /// Returns true when this call performed the final release.
    pub(crate) fn worker_exited(&self, who: Worker) -> bool {
        let mut st = self.state.lock();
        match who {
            Worker::Reader => st.have_reader_thread = false,
            Worker::Writer => st.have_writer_thread = false,
        }
        if !st.have_reader_thread && !st.have_writer_thread && st.sock.is_some() {
            st.sock = None;
            st.really_closed = true;
            debug!(peer = %self.name, "socket released");
            true
        } else {
            false
        }
    }

    /// Both workers gone and the fd released; the dial loop may try again.
    pub(crate) fn ready_to_dial(&self) -> bool {
        let st = self.state.lock();
        st.really_closed && st.sock.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_before_install_is_a_noop() {
        let peer = Peer::new(PeerId(1), "nodeb".into(), 7000);
        assert!(!peer.connected());
        peer.close_sock();
        assert!(peer.ready_to_dial());
    }

    #[test]
    fn release_requires_both_workers_to_exit() {
        let peer = Peer::new(PeerId(1), "nodeb".into(), 7000);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let sock = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        peer.install_sock(sock, None).ok().unwrap();
        assert!(peer.connected());
        assert!(!peer.ready_to_dial());

        peer.close_sock();
        assert!(!peer.connected());
        assert!(!peer.worker_exited(Worker::Reader));
        assert!(!peer.ready_to_dial(), "fd must stay until the writer is gone");
        assert!(peer.worker_exited(Worker::Writer));
        assert!(peer.ready_to_dial());
    }

    #[test]
    fn second_install_is_rejected() {
        let peer = Peer::new(PeerId(1), "nodeb".into(), 7000);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let b = TcpStream::connect(addr).unwrap();
        assert!(peer.install_sock(a, None).is_ok());
        assert!(peer.install_sock(b, None).is_err());
    }
}
