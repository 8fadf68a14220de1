//! Idle timers for admitted appsock sessions.
//!
//! The transport hands appsock streams to the host, but the host can ask it
//! to watch a clone of the socket: if no read/write activity is reported
//! within the configured idle budget, the liveness checker shuts the socket
//! down. Timers are refreshed by `touch_read` / `touch_write`.

use std::{
    net::{Shutdown, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::mesh::MeshInner;

/// Handle for one watched socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub(crate) u64);

pub(crate) struct Watched {
    pub id: WatchId,
    pub sock: TcpStream,
    pub read_idle: Option<Duration>,
    pub write_idle: Option<Duration>,
    pub last_read: Instant,
    pub last_write: Instant,
}

impl Watched {
    fn expired(&self, now: Instant) -> bool {
        let read_hit = self
            .read_idle
            .is_some_and(|idle| now.duration_since(self.last_read) > idle);
        let write_hit = self
            .write_idle
            .is_some_and(|idle| now.duration_since(self.last_write) > idle);
        read_hit || write_hit
    }
}

/// One pass over the watchlist; called by the liveness checker every second.
pub(crate) fn scan(mesh: &Arc<MeshInner>) {
    let now = Instant::now();
    let mut list = mesh.watchlist.lock();
    list.retain(|w| {
        if !w.expired(now) {
            return true;
        }
        warn!(watch = ?w.id, "appsock idle budget exceeded, shutting down");
        let _ = w.sock.shutdown(Shutdown::Both);
        false
    });
}

pub(crate) fn watch(
    mesh: &MeshInner,
    sock: TcpStream,
    read_idle: Option<Duration>,
    write_idle: Option<Duration>,
) -> WatchId {
    let mut list = mesh.watchlist.lock();
    let id = WatchId(mesh.next_watch_id());
    let now = Instant::now();
    debug!(watch = ?id, ?read_idle, ?write_idle, "watching appsock");
    list.push(Watched { id, sock, read_idle, write_idle, last_read: now, last_write: now });
    id
}

pub(crate) fn touch_read(mesh: &MeshInner, id: WatchId) {
    let mut list = mesh.watchlist.lock();
    if let Some(w) = list.iter_mut().find(|w| w.id == id) {
        w.last_read = Instant::now();
    }
}

pub(crate) fn touch_write(mesh: &MeshInner, id: WatchId) {
    let mut list = mesh.watchlist.lock();
    if let Some(w) = list.iter_mut().find(|w| w.id == id) {
        w.last_write = Instant::now();
    }
}

pub(crate) fn unwatch(mesh: &MeshInner, id: WatchId) {
    let mut list = mesh.watchlist.lock();
    list.retain(|w| w.id != id);
}
