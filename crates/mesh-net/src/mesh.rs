use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::CString,
    io,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use mesh_wire::{encode_decom_name, Envelope, FrameType, UserMsgHeader};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    ack,
    config::{MeshConfig, Tunables},
    conn,
    error::{RegisterError, SendError},
    heartbeat,
    hooks::{
        AllowHook, AppsockHook, GetLsnHook, Handler, HandlerCtx, HandlerFn, HookSet, MachineUpHook,
        NameService, NetCmpHook, NodeHook, QstatHook, ThreadHook, TlsHook,
    },
    peer::{Peer, PeerId, Worker},
    queue::{EnqueueFlags, Enqueued, Frame},
    stats::{HandlerStats, MeshCounts, PeerStats, QueueFrameInfo},
    table::PeerTable,
    timing::{now_ms, sleep_unless},
    watchlist::{self, WatchId, Watched},
};

/// Every mesh in the process, for cross-mesh operations (subnet disable).
static REGISTRY: Lazy<Mutex<Vec<Weak<MeshInner>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Shut down every open socket dialed through the given subnet, across all
/// meshes in the process.
pub(crate) fn close_sockets_on_subnet(idx: usize) {
    let meshes: Vec<Arc<MeshInner>> = {
        let mut reg = REGISTRY.lock();
        reg.retain(|w| w.strong_count() > 0);
        reg.iter().filter_map(Weak::upgrade).collect()
    };
    for mesh in meshes {
        let table = mesh.table.read();
        for peer in table.iter() {
            let last = peer.state.lock().last_subnet;
            if last == Some(idx) {
                peer.close_sock();
            }
        }
    }
}

/// Process-wide state for one mesh membership. Public API lives on [`Mesh`];
/// worker threads share this through `Arc`s.
pub(crate) struct MeshInner {
    pub cfg: MeshConfig,
    /// Canonical (lowercased) own hostname.
    my_name: String,
    /// Listen/advertise port; resolved through the name service at start
    /// when the config left it zero.
    my_port: AtomicU32,
    /// Child-net index; zero for a parent mesh that owns the listen socket.
    pub netnum: u8,
    parent: Weak<MeshInner>,
    children: Mutex<HashMap<u8, Arc<MeshInner>>>,

    pub tunables: Tunables,
    pub table: RwLock<PeerTable>,
    /// Dial-name overrides: peer identity stays the hostname, but the dial
    /// resolves this string instead (alternate interfaces, test rigs).
    host_aliases: Mutex<HashMap<String, String>>,
    /// Single-entry cache of the last successful name lookup.
    lookup_cache: Mutex<Option<Arc<Peer>>>,
    handlers: RwLock<Vec<Option<Arc<Handler>>>>,
    hooks: RwLock<HookSet>,
    sanctioned: Mutex<Vec<String>>,
    /// Decommissioned names. A tombstoned peer is refused on accept and in
    /// gossip until the host explicitly re-adds it.
    decommed: Mutex<Vec<String>>,
    pub watchlist: Mutex<Vec<Watched>>,
    watch_seq: AtomicU64,

    listener: Mutex<Option<TcpListener>>,
    seqnum: AtomicU32,
    exiting: AtomicBool,
    started: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshInner {
    pub(crate) fn exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn my_name(&self) -> &str {
        &self.my_name
    }

    pub(crate) fn my_port(&self) -> u16 {
        self.my_port.load(Ordering::Relaxed) as u16
    }

    pub(crate) fn next_watch_id(&self) -> u64 {
        self.watch_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn next_seqnum(&self) -> u32 {
        self.seqnum.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn child(&self, netnum: u8) -> Option<Arc<MeshInner>> {
        self.children.lock().get(&netnum).cloned()
    }

    /// The name a dial should resolve for `host` (alias or the name
    /// itself).
    pub(crate) fn dial_name(&self, host: &str) -> String {
        self.host_aliases.lock().get(host).cloned().unwrap_or_else(|| host.to_owned())
    }

    // hook accessors clone the Arc out so no lock is held across the call

    pub(crate) fn hook_allow(&self) -> Option<AllowHook> {
        self.hooks.read().allow.clone()
    }

    pub(crate) fn hook_machine_up(&self) -> Option<MachineUpHook> {
        self.hooks.read().machine_up.clone()
    }

    pub(crate) fn hook_new_node(&self) -> Option<NodeHook> {
        self.hooks.read().new_node.clone()
    }

    pub(crate) fn hook_host_down(&self) -> Option<NodeHook> {
        self.hooks.read().host_down.clone()
    }

    pub(crate) fn hook_hello(&self) -> Option<NodeHook> {
        self.hooks.read().hello.clone()
    }

    pub(crate) fn hook_getlsn(&self) -> Option<GetLsnHook> {
        self.hooks.read().getlsn.clone()
    }

    pub(crate) fn hook_netcmp(&self) -> Option<NetCmpHook> {
        self.hooks.read().netcmp.clone()
    }

    pub(crate) fn hook_qstat(&self) -> Option<Arc<dyn QstatHook>> {
        self.hooks.read().qstat.clone()
    }

    pub(crate) fn hook_appsock(&self) -> Option<AppsockHook> {
        self.hooks.read().appsock.clone()
    }

    pub(crate) fn hook_admin_appsock(&self) -> Option<AppsockHook> {
        self.hooks.read().admin_appsock.clone()
    }

    pub(crate) fn hook_name_service(&self) -> Option<Arc<dyn NameService>> {
        self.hooks.read().name_service.clone()
    }

    pub(crate) fn hook_tls(&self) -> Option<Arc<dyn TlsHook>> {
        self.hooks.read().tls.clone()
    }

    pub(crate) fn handler(&self, usertype: u32) -> Option<Arc<Handler>> {
        self.handlers.read().get(usertype as usize)?.clone()
    }

    /// Spawn a named thread wrapped in the host's start/stop callbacks.
    pub(crate) fn spawn_thread(
        &self,
        name: &'static str,
        f: impl FnOnce() + Send + 'static,
    ) -> Option<JoinHandle<()>> {
        let (start, stop) = {
            let hooks = self.hooks.read();
            (hooks.thread_start.clone(), hooks.thread_stop.clone())
        };
        match std::thread::Builder::new().name(name.to_owned()).spawn(move || {
            if let Some(hook) = &start {
                hook(name);
            }
            f();
            if let Some(hook) = &stop {
                hook(name);
            }
        }) {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(thread = name, %err, "thread spawn failed");
                None
            }
        }
    }

    fn spawn_mesh_thread(
        self: &Arc<Self>,
        name: &'static str,
        f: impl FnOnce(Arc<MeshInner>) + Send + 'static,
    ) {
        let mesh = self.clone();
        if let Some(handle) = self.spawn_thread(name, move || f(mesh)) {
            self.threads.lock().push(handle);
        }
    }

    /// Spawn the reader/writer pair for a freshly installed socket. The
    /// install already set the worker flags; a failed spawn must undo its
    /// half so the connection can be torn down normally.
    pub(crate) fn spawn_workers(self: &Arc<Self>, peer: &Arc<Peer>, rd: TcpStream, wr: TcpStream) {
        let (mesh, p) = (self.clone(), peer.clone());
        if self.spawn_thread("net-reader", move || crate::io::reader_loop(&mesh, &p, rd)).is_none()
        {
            peer.close_sock();
            if peer.worker_exited(Worker::Reader) {
                self.on_socket_released(peer);
            }
        }
        let (mesh, p) = (self.clone(), peer.clone());
        if self.spawn_thread("net-writer", move || crate::io::writer_loop(&mesh, &p, wr)).is_none()
        {
            peer.close_sock();
            if peer.worker_exited(Worker::Writer) {
                self.on_socket_released(peer);
            }
        }
    }

    /// A peer's socket was fully released; reset the hello gate and tell
    /// the host.
    pub(crate) fn on_socket_released(&self, peer: &Arc<Peer>) {
        peer.got_hello.store(false, Ordering::Release);
        if self.exiting() {
            return;
        }
        if let Some(hook) = self.hook_host_down() {
            hook(&peer.name);
        }
    }

    fn canonical<'a>(name: &'a str) -> Cow<'a, str> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(name.to_ascii_lowercase())
        } else {
            Cow::Borrowed(name)
        }
    }

    /// Name lookup through the single-entry cache.
    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Peer>> {
        let name = Self::canonical(name);
        {
            let cache = self.lookup_cache.lock();
            if let Some(peer) = cache.as_ref() {
                if *peer.name == *name {
                    return Some(peer.clone());
                }
            }
        }
        let peer = self.table.read().get(&name)?;
        *self.lookup_cache.lock() = Some(peer.clone());
        Some(peer)
    }

    /// Idempotent insert-by-name, firing the new-node plumbing on creation.
    pub(crate) fn ensure_peer(
        self: &Arc<Self>,
        name: &str,
        port: u16,
    ) -> Result<(Arc<Peer>, bool), SendError> {
        let name = Self::canonical(name);
        if name.is_empty() {
            return Err(SendError::InvalidNode);
        }
        if self.decommed.lock().iter().any(|d| *d == *name) {
            debug!(peer = %name, "refusing decommissioned peer");
            return Err(SendError::Closed);
        }
        let (peer, created) = self.table.write().insert(&name, port);
        if created {
            debug!(peer = %name, port, "peer added");
            if let Some(hook) = self.hook_qstat() {
                hook.init(&name);
            }
            if let Some(hook) = self.hook_new_node() {
                hook(&name);
            }
            if *name != self.my_name && self.started.load(Ordering::Acquire) {
                self.start_connect_thread(&peer);
            }
        }
        Ok((peer, created))
    }

    /// Spawn the peer's permanent dial thread unless one is already live.
    pub(crate) fn start_connect_thread(self: &Arc<Self>, peer: &Arc<Peer>) {
        {
            let mut st = peer.state.lock();
            if st.have_connect_thread {
                return;
            }
            st.have_connect_thread = true;
        }
        let (mesh, p) = (self.clone(), peer.clone());
        if self.spawn_thread("net-connect", move || conn::connect_loop(&mesh, &p)).is_none() {
            peer.state.lock().have_connect_thread = false;
        }
    }

    /// Port resolution for a dial: the peer's known port, else the name
    /// service with the parent's triple (child nets share the parent's
    /// rendezvous), else `getservbyname`.
    pub(crate) fn resolve_peer_port(&self, peer: &Peer) -> Option<u16> {
        let known = peer.port();
        if known != 0 {
            return Some(known);
        }
        let owner = self.parent.upgrade();
        let cfg = owner.as_ref().map_or(&self.cfg, |parent| &parent.cfg);
        if let Some(ns) = self.hook_name_service() {
            match ns.resolve(&cfg.app, &cfg.service, &cfg.instance) {
                Ok(port) if port != 0 => return Some(port),
                Ok(_) => {}
                Err(err) => debug!(peer = %peer.name, %err, "name service resolve failed"),
            }
        }
        getservbyname_port(&cfg.service)
    }

    /// Build one complete wire frame addressed to `peer`. The `from_*`
    /// fields are placeholders until the writer rewrites them at transmit.
    fn build_frame(
        &self,
        peer: &Peer,
        typ: FrameType,
        header: Option<UserMsgHeader>,
        bufs: &[&[u8]],
        flags: EnqueueFlags,
    ) -> Result<Frame, SendError> {
        let env = Envelope {
            from_host: self.my_name.clone(),
            from_port: self.my_port(),
            to_host: peer.name.to_string(),
            to_port: peer.port(),
            typ,
        };
        let body_len: usize = bufs.iter().map(|b| b.len()).sum();
        let mut buf = Vec::new();
        buf.try_reserve(mesh_wire::ENVELOPE_LEN + 64 + body_len)
            .map_err(|_| SendError::MallocFail)?;
        env.encode(&mut buf).map_err(|_| SendError::Internal)?;
        let body_off = if let Some(hdr) = header {
            hdr.encode(&mut buf);
            buf.len()
        } else {
            0
        };
        for b in bufs {
            buf.extend_from_slice(b);
        }
        Ok(Frame::new(buf, typ, flags, body_off))
    }

    fn enqueue_frame(&self, peer: &Arc<Peer>, frame: Frame) -> Result<(), SendError> {
        let cmp = frame.flags.contains(EnqueueFlags::INORDER).then(|| self.hook_netcmp()).flatten();
        let typ = frame.typ as i32;
        let len = frame.buf.len();
        let outcome = {
            let mut q = peer.queue.lock();
            q.enqueue(
                frame,
                self.tunables.max_queue(),
                self.tunables.max_bytes(),
                self.tunables.reorder_lookahead(),
                cmp.as_deref(),
            )
        };
        match outcome {
            Ok(Enqueued::Queued) => {
                if let Some(hook) = self.hook_qstat() {
                    hook.enqueue(&peer.name, typ, len);
                }
                peer.write_wake.notify_one();
                Ok(())
            }
            Ok(Enqueued::Deduped) => Ok(()),
            Err(_) => Err(SendError::QueueFull),
        }
    }

    /// Internal send for control frames (heartbeat, hello, decom, ack).
    /// These bypass the got-hello gate; user messages never come through
    /// here.
    pub(crate) fn enqueue_control(
        &self,
        peer: &Arc<Peer>,
        typ: FrameType,
        body: &[u8],
        flags: EnqueueFlags,
    ) -> Result<(), SendError> {
        if peer.decom.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        if !peer.connected() {
            return Err(SendError::NoSock);
        }
        let frame = self.build_frame(peer, typ, None, &[body], flags)?;
        self.enqueue_frame(peer, frame)
    }

    /// The user-message send path shared by every public send variant.
    fn send_user(
        &self,
        to: &str,
        usertype: u32,
        bufs: &[&[u8]],
        mut flags: EnqueueFlags,
        ack_seqnum: Option<u32>,
    ) -> Result<(), SendError> {
        if self.exiting() {
            return Err(SendError::Closed);
        }
        let peer = self.lookup(to).ok_or(SendError::InvalidNode)?;
        if *peer.name == self.my_name {
            return Err(SendError::SendToMe);
        }
        if peer.decom.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        if !peer.connected() || !peer.got_hello.load(Ordering::Acquire) {
            return Err(SendError::NoSock);
        }

        // every flush_interval user sends, the next frame carries no-delay
        let interval = self.tunables.flush_interval();
        if interval > 0 {
            let n = peer.sends_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
            if n >= interval {
                peer.sends_since_flush.store(0, Ordering::Relaxed);
                flags |= EnqueueFlags::NO_DELAY;
            }
        }

        if flags.contains(EnqueueFlags::THROTTLE_WAIT) {
            self.throttle_wait(&peer)?;
        }

        let datalen: usize = bufs.iter().map(|b| b.len()).sum();
        let hdr = UserMsgHeader {
            usertype,
            seqnum: ack_seqnum.unwrap_or_else(|| self.next_seqnum()),
            waitforack: ack_seqnum.is_some(),
            datalen: datalen as u32,
        };
        let frame = self.build_frame(&peer, FrameType::UserMsg, Some(hdr), bufs, flags)?;
        self.enqueue_frame(&peer, frame)
    }

    /// Block until the peer's queue drains below the throttle threshold.
    /// Bulk producers use this to leave heartbeats room.
    fn throttle_wait(&self, peer: &Arc<Peer>) -> Result<(), SendError> {
        let pct = self.tunables.throttle_pct();
        if pct == 0 || pct >= 100 {
            return Ok(());
        }
        let mut waited = false;
        let mut guard = peer.throttle.lock();
        loop {
            if self.exiting() || peer.decom.load(Ordering::Acquire) {
                return Err(SendError::Closed);
            }
            if !peer.connected() {
                return Err(SendError::WriteFail);
            }
            let below = {
                let q = peer.queue.lock();
                q.below(pct, self.tunables.max_queue(), self.tunables.max_bytes())
            };
            if below {
                return Ok(());
            }
            if !waited {
                waited = true;
                peer.stats.throttle_waits.fetch_add(1, Ordering::Relaxed);
            }
            let _ = peer.throttle_wake.wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    fn send_with_ack(
        &self,
        to: &str,
        usertype: u32,
        body: &[u8],
        waitms: u64,
    ) -> Result<(i32, Option<Vec<u8>>), SendError> {
        // hold our own Arc on the peer across the wait so a concurrent
        // decom can't pull the wait list out from under us
        let peer = self.lookup(to).ok_or(SendError::InvalidNode)?;
        let seqnum = self.next_seqnum();
        peer.waiters.lock().add(seqnum);

        if let Err(err) =
            self.send_user(to, usertype, &[body], EnqueueFlags::NO_DELAY, Some(seqnum))
        {
            peer.waiters.lock().remove(seqnum);
            return Err(err);
        }

        let deadline = Instant::now() + Duration::from_millis(waitms);
        let mut waiters = peer.waiters.lock();
        loop {
            if let Some(waiter) = waiters.take_if_done(seqnum) {
                return ack::waiter_result(waiter);
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                waiters.remove(seqnum);
                return Err(SendError::Timeout);
            };
            let _ = peer.ack_wake.wait_for(&mut waiters, left);
        }
    }

    /// Remove a peer: splice it out, fail its waiters, tear the socket
    /// down, and reap the entry once its threads have drained.
    pub(crate) fn decom_peer(self: &Arc<Self>, name: &str) {
        let name = Self::canonical(name);
        if *name == self.my_name {
            warn!("refusing to decommission ourselves");
            return;
        }
        {
            let mut decommed = self.decommed.lock();
            if !decommed.iter().any(|d| *d == *name) {
                decommed.push(name.to_string());
            }
        }
        let peer = self.table.write().remove(&name);
        *self.lookup_cache.lock() = None;
        let Some(peer) = peer else {
            return;
        };
        info!(peer = %name, "decommissioning peer");
        peer.decom.store(true, Ordering::Release);
        peer.close_sock();
        if let Some(hook) = self.hook_qstat() {
            hook.free(&name);
        }
        if let Some(hook) = self.hook_host_down() {
            hook(&name);
        }

        // deferred removal: the slab only goes once every worker is out
        let reaped = peer.clone();
        let _detached = self.spawn_thread("net-reaper", move || {
            let gone = || {
                let st = reaped.state.lock();
                st.really_closed
                    && !st.have_connect_thread
                    && !st.have_reader_thread
                    && !st.have_writer_thread
            };
            sleep_unless(Duration::from_secs(30), gone);
            if !gone() {
                warn!(peer = %reaped.name, "decom reaper giving up on stuck workers");
            }
            reaped.queue.lock().clear();
        });
    }

    fn peer_stats(&self, peer: &Arc<Peer>) -> PeerStats {
        let (queue_count, queue_bytes, peaks, dedupe, full, reorder) = {
            let q = peer.queue.lock();
            (
                q.len(),
                q.bytes(),
                (q.peak_count, q.peak_bytes),
                q.dedupe_count,
                q.full_count,
                q.reorder_count,
            )
        };
        let last_rx = peer.last_rx_ms.load(Ordering::Relaxed);
        PeerStats {
            name: peer.name.to_string(),
            id: peer.id,
            connected: peer.connected(),
            got_hello: peer.got_hello.load(Ordering::Acquire),
            sanctioned: self.sanctioned.lock().iter().any(|s| *s == *peer.name),
            bytes_tx: peer.stats.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: peer.stats.bytes_rx.load(Ordering::Relaxed),
            throttle_waits: peer.stats.throttle_waits.load(Ordering::Relaxed),
            queue_count,
            queue_bytes,
            peak_queue_count: peaks.0,
            peak_queue_bytes: peaks.1,
            dedupe_count: dedupe,
            queue_full_count: full,
            reorder_count: reorder,
            distress: peer.distress.load(Ordering::Relaxed),
            last_rx_age_ms: (last_rx != 0).then(|| now_ms().saturating_sub(last_rx)),
        }
    }

    fn start(self: &Arc<Self>) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.netnum == 0 {
            let listener = match self.listener.lock().take() {
                Some(listener) => {
                    if self.my_port() == 0 {
                        let port = listener.local_addr()?.port();
                        self.my_port.store(u32::from(port), Ordering::Relaxed);
                    }
                    listener
                }
                None => {
                    if self.my_port() == 0 {
                        let resolved = self.resolve_own_port()?;
                        self.my_port.store(u32::from(resolved), Ordering::Relaxed);
                    }
                    TcpListener::bind(("0.0.0.0", self.my_port()))?
                }
            };
            if let Some(peer) = self.lookup(&self.my_name) {
                peer.set_port(self.my_port());
            }

            if let Some(ns) = self.hook_name_service() {
                let cfg = &self.cfg;
                match ns.register(&cfg.app, &cfg.service, &cfg.instance, self.my_port()) {
                    Ok(port) if port == self.my_port() => {}
                    Ok(port) => {
                        error!(
                            ours = self.my_port(),
                            theirs = port,
                            "name service registration diverged, aborting"
                        );
                        std::process::abort();
                    }
                    Err(err) => warn!(%err, "name service registration failed"),
                }
            }

            self.spawn_mesh_thread("net-accept", move |mesh| conn::accept_loop(&mesh, listener));
        } else if self.my_port() == 0 {
            // child nets advertise the parent's listen port
            if let Some(parent) = self.parent.upgrade() {
                self.my_port.store(u32::from(parent.my_port()), Ordering::Relaxed);
            }
        }

        self.spawn_mesh_thread("net-heartbeat-send", |mesh| heartbeat::heartbeat_send_loop(&mesh));
        self.spawn_mesh_thread("net-heartbeat-check", |mesh| {
            heartbeat::heartbeat_check_loop(&mesh);
        });

        let peers: Vec<_> = self.table.read().iter().cloned().collect();
        for peer in peers {
            if *peer.name != self.my_name {
                self.start_connect_thread(&peer);
            }
        }
        info!(mesh = %self.my_name, port = self.my_port(), netnum = self.netnum, "mesh started");
        Ok(())
    }

    fn resolve_own_port(&self) -> io::Result<u16> {
        if let Some(ns) = self.hook_name_service() {
            let cfg = &self.cfg;
            let port = ns.resolve(&cfg.app, &cfg.service, &cfg.instance)?;
            if port != 0 {
                return Ok(port);
            }
        }
        getservbyname_port(&self.cfg.service)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot resolve own port"))
    }

    fn shutdown(self: &Arc<Self>) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(mesh = %self.my_name, "mesh shutting down");

        let children: Vec<_> = self.children.lock().values().cloned().collect();
        for child in children {
            child.shutdown();
        }

        {
            let table = self.table.read();
            for peer in table.iter() {
                peer.close_sock();
            }
        }

        // poke the accept thread out of accept(2)
        if self.netnum == 0 && self.started.load(Ordering::Acquire) {
            let _ = TcpStream::connect(("127.0.0.1", self.my_port()));
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn getservbyname_port(service: &str) -> Option<u16> {
    let name = CString::new(service).ok()?;
    let proto = CString::new("tcp").ok()?;
    let ent = unsafe { libc::getservbyname(name.as_ptr(), proto.as_ptr()) };
    if ent.is_null() {
        return None;
    }
    let port = unsafe { (*ent).s_port };
    Some(u16::from_be(port as u16))
}

/// One node's membership in one cluster mesh.
///
/// Construction order: [`Mesh::new`], handler/hook registration and peer
/// seeding, then [`Mesh::start`]. `start` binds the listen socket, spawns
/// the accept and heartbeat threads, and begins dialing every seeded peer.
/// The mesh runs until [`Mesh::shutdown`].
///
/// `Mesh` is a cheap handle; clones share the same membership and can be
/// used from any thread.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    pub fn new(mut cfg: MeshConfig) -> io::Result<Self> {
        let my_name = cfg.hostname.trim().to_ascii_lowercase();
        if my_name.is_empty() || !my_name.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad hostname"));
        }
        let listener = cfg.listener.take();
        let max_user_type = cfg.max_user_type;
        let port = cfg.port;

        let inner = Arc::new(MeshInner {
            cfg,
            my_name: my_name.clone(),
            my_port: AtomicU32::new(u32::from(port)),
            netnum: 0,
            parent: Weak::new(),
            children: Mutex::new(HashMap::new()),
            tunables: Tunables::default(),
            table: RwLock::new(PeerTable::default()),
            host_aliases: Mutex::new(HashMap::new()),
            lookup_cache: Mutex::new(None),
            handlers: RwLock::new(vec![None; max_user_type]),
            hooks: RwLock::new(HookSet::default()),
            sanctioned: Mutex::new(Vec::new()),
            decommed: Mutex::new(Vec::new()),
            watchlist: Mutex::new(Vec::new()),
            watch_seq: AtomicU64::new(0),
            listener: Mutex::new(listener),
            seqnum: AtomicU32::new(0),
            exiting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        // our own name is always in the table; it is never a send target
        inner.table.write().insert(&my_name, port);
        REGISTRY.lock().push(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Create a child mesh multiplexed over this (parent) mesh's listen
    /// socket, selected on the wire by the connect record's child-net
    /// index. The child has its own peers, handlers and heartbeats.
    pub fn new_child(&self, netnum: u8, service: &str, instance: &str) -> io::Result<Mesh> {
        if netnum == 0 || netnum > 0x0f {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "child netnum out of range"));
        }
        let parent = &self.inner;
        let cfg = MeshConfig {
            app: parent.cfg.app.clone(),
            service: service.to_owned(),
            instance: instance.to_owned(),
            hostname: parent.my_name.clone(),
            port: parent.my_port(),
            max_user_type: parent.cfg.max_user_type,
            listener: None,
            tls_policy: parent.cfg.tls_policy,
        };
        let max_user_type = cfg.max_user_type;
        let port = cfg.port;
        let my_name = cfg.hostname.clone();

        let inner = Arc::new(MeshInner {
            cfg,
            my_name: my_name.clone(),
            my_port: AtomicU32::new(u32::from(port)),
            netnum,
            parent: Arc::downgrade(parent),
            children: Mutex::new(HashMap::new()),
            tunables: Tunables::default(),
            table: RwLock::new(PeerTable::default()),
            host_aliases: Mutex::new(HashMap::new()),
            lookup_cache: Mutex::new(None),
            handlers: RwLock::new(vec![None; max_user_type]),
            hooks: RwLock::new(HookSet::default()),
            sanctioned: Mutex::new(Vec::new()),
            decommed: Mutex::new(Vec::new()),
            watchlist: Mutex::new(Vec::new()),
            watch_seq: AtomicU64::new(0),
            listener: Mutex::new(None),
            seqnum: AtomicU32::new(0),
            exiting: AtomicBool::new(false),
            started: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });
        inner.table.write().insert(&my_name, port);
        REGISTRY.lock().push(Arc::downgrade(&inner));
        parent.children.lock().insert(netnum, inner.clone());
        Ok(Mesh { inner })
    }

    pub fn start(&self) -> io::Result<()> {
        self.inner.start()
    }

    /// Cooperative shutdown: close every socket, wake every blocked thread,
    /// join the mesh singletons. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn my_name(&self) -> &str {
        self.inner.my_name()
    }

    pub fn my_port(&self) -> u16 {
        self.inner.my_port()
    }

    // ---- membership ----

    /// Seed or re-announce a peer. Port zero means resolve through the name
    /// service on each dial. An explicit add clears any decom tombstone.
    pub fn add_peer(&self, host: &str, port: u16) -> Result<PeerId, SendError> {
        let name = host.to_ascii_lowercase();
        self.inner.decommed.lock().retain(|d| *d != name);
        let (peer, _) = self.inner.ensure_peer(&name, port)?;
        Ok(peer.id)
    }

    /// Register a dial-name override: connections to `host` resolve
    /// `dial_as` instead, while the peer keeps `host` as its identity.
    /// Covers alternate interfaces and multi-node-per-machine test rigs.
    pub fn add_host_alias(&self, host: &str, dial_as: &str) {
        self.inner
            .host_aliases
            .lock()
            .insert(host.to_ascii_lowercase(), dial_as.to_owned());
    }

    pub fn peer_id(&self, host: &str) -> Option<PeerId> {
        self.inner.lookup(host).map(|p| p.id)
    }

    pub fn peer_name(&self, id: PeerId) -> Option<String> {
        self.inner.table.read().by_id(id).map(|p| p.name.to_string())
    }

    /// All known peer hostnames, ourselves included.
    pub fn peers(&self) -> Vec<String> {
        self.inner.table.read().iter().map(|p| p.name.to_string()).collect()
    }

    pub fn is_connected(&self, host: &str) -> bool {
        self.inner.lookup(host).is_some_and(|p| p.connected())
    }

    pub fn got_hello(&self, host: &str) -> bool {
        self.inner
            .lookup(host)
            .is_some_and(|p| p.got_hello.load(Ordering::Acquire))
    }

    /// Locally decommission a peer: remove it, drop its connection, reap
    /// its threads.
    pub fn decom(&self, host: &str) {
        self.inner.decom_peer(host);
    }

    /// Tell every connected peer to decommission `host`, then do so
    /// locally.
    pub fn decom_all(&self, host: &str) -> Result<(), SendError> {
        let host = host.to_ascii_lowercase();
        let mut body = Vec::new();
        encode_decom_name(&mut body, &host).map_err(|_| SendError::Internal)?;
        let peers: Vec<_> = self.inner.table.read().iter().cloned().collect();
        for peer in peers {
            if *peer.name == *self.inner.my_name() || !peer.connected() {
                continue;
            }
            let flags = EnqueueFlags::HEAD | EnqueueFlags::NO_LIMIT | EnqueueFlags::NO_DELAY;
            if let Err(err) = self.inner.enqueue_control(&peer, FrameType::DecomName, &body, flags)
            {
                debug!(peer = %peer.name, ?err, "decom broadcast enqueue failed");
            }
        }
        self.inner.decom_peer(&host);
        Ok(())
    }

    // ---- sanctioned list ----

    pub fn sanction(&self, host: &str) {
        let host = host.to_ascii_lowercase();
        let mut list = self.inner.sanctioned.lock();
        if !list.iter().any(|s| *s == host) {
            list.push(host);
        }
    }

    pub fn unsanction(&self, host: &str) {
        let host = host.to_ascii_lowercase();
        self.inner.sanctioned.lock().retain(|s| *s != host);
    }

    pub fn sanctioned(&self) -> Vec<String> {
        self.inner.sanctioned.lock().clone()
    }

    // ---- registration ----

    /// Bind `usertype` to a handler. The handler runs on the peer's reader
    /// thread; long work belongs on the host's own threads.
    pub fn register_handler(
        &self,
        usertype: u32,
        name: &str,
        func: impl Fn(&mut HandlerCtx<'_>) + Send + Sync + 'static,
    ) -> Result<(), RegisterError> {
        let slot = usertype as usize;
        let mut handlers = self.inner.handlers.write();
        if slot >= handlers.len() {
            return Err(RegisterError::UsertypeOutOfRange(usertype));
        }
        if handlers[slot].is_some() {
            return Err(RegisterError::Duplicate(usertype));
        }
        let func: HandlerFn = Arc::new(func);
        handlers[slot] = Some(Arc::new(Handler::new(name, func)));
        Ok(())
    }

    pub fn set_allow_hook(&self, hook: AllowHook) {
        self.inner.hooks.write().allow = Some(hook);
    }

    pub fn set_machine_up_hook(&self, hook: MachineUpHook) {
        self.inner.hooks.write().machine_up = Some(hook);
    }

    pub fn set_new_node_hook(&self, hook: NodeHook) {
        self.inner.hooks.write().new_node = Some(hook);
    }

    pub fn set_host_down_hook(&self, hook: NodeHook) {
        self.inner.hooks.write().host_down = Some(hook);
    }

    pub fn set_hello_hook(&self, hook: NodeHook) {
        self.inner.hooks.write().hello = Some(hook);
    }

    pub fn set_getlsn_hook(&self, hook: GetLsnHook) {
        self.inner.hooks.write().getlsn = Some(hook);
    }

    pub fn set_netcmp_hook(&self, hook: NetCmpHook) {
        self.inner.hooks.write().netcmp = Some(hook);
    }

    pub fn set_qstat_hook(&self, hook: Arc<dyn QstatHook>) {
        self.inner.hooks.write().qstat = Some(hook);
    }

    pub fn set_appsock_hook(&self, hook: AppsockHook) {
        self.inner.hooks.write().appsock = Some(hook);
    }

    pub fn set_admin_appsock_hook(&self, hook: AppsockHook) {
        self.inner.hooks.write().admin_appsock = Some(hook);
    }

    pub fn set_thread_hooks(&self, start: ThreadHook, stop: ThreadHook) {
        let mut hooks = self.inner.hooks.write();
        hooks.thread_start = Some(start);
        hooks.thread_stop = Some(stop);
    }

    pub fn set_name_service(&self, ns: Arc<dyn NameService>) {
        self.inner.hooks.write().name_service = Some(ns);
    }

    pub fn set_tls_hook(&self, hook: Arc<dyn TlsHook>) {
        self.inner.hooks.write().tls = Some(hook);
    }

    // ---- sending ----

    /// Fire-and-forget send. Per-peer FIFO; success means enqueued, not
    /// delivered.
    pub fn send(&self, to: &str, usertype: u32, body: &[u8]) -> Result<(), SendError> {
        self.inner.send_user(to, usertype, &[body], EnqueueFlags::empty(), None)
    }

    /// Send with explicit queueing flags.
    pub fn send_flags(
        &self,
        to: &str,
        usertype: u32,
        body: &[u8],
        flags: EnqueueFlags,
    ) -> Result<(), SendError> {
        self.inner.send_user(to, usertype, &[body], flags, None)
    }

    /// Gathering send: the frame's payload is the concatenation of `bufs`.
    pub fn send_tails(
        &self,
        to: &str,
        usertype: u32,
        bufs: &[&[u8]],
        flags: EnqueueFlags,
    ) -> Result<(), SendError> {
        self.inner.send_user(to, usertype, bufs, flags, None)
    }

    /// Send positioned by the registered netcmp comparator, within the
    /// bounded reorder window.
    pub fn send_inorder(&self, to: &str, usertype: u32, body: &[u8]) -> Result<(), SendError> {
        self.inner.send_user(to, usertype, &[body], EnqueueFlags::INORDER, None)
    }

    /// Synchronous send: block up to `waitms` for the remote handler's ack
    /// and return its code.
    pub fn send_with_ack(
        &self,
        to: &str,
        usertype: u32,
        body: &[u8],
        waitms: u64,
    ) -> Result<i32, SendError> {
        self.inner.send_with_ack(to, usertype, body, waitms).map(|(rc, _)| rc)
    }

    /// Like [`send_with_ack`](Self::send_with_ack) but also surfaces the
    /// handler's optional small payload.
    pub fn send_with_ack_payload(
        &self,
        to: &str,
        usertype: u32,
        body: &[u8],
        waitms: u64,
    ) -> Result<(i32, Option<Vec<u8>>), SendError> {
        self.inner.send_with_ack(to, usertype, body, waitms)
    }

    // ---- introspection ----

    pub fn counts(&self) -> MeshCounts {
        let sanctioned = self.inner.sanctioned.lock().clone();
        let table = self.inner.table.read();
        let mut counts = MeshCounts { total: table.len(), ..MeshCounts::default() };
        for peer in table.iter() {
            let connected = peer.connected();
            if connected {
                counts.connected += 1;
            }
            if sanctioned.iter().any(|s| *s == *peer.name) {
                counts.sanctioned += 1;
                if connected {
                    counts.sanctioned_connected += 1;
                }
            }
        }
        counts
    }

    pub fn peer_stats(&self, host: &str) -> Option<PeerStats> {
        let peer = self.inner.lookup(host)?;
        Some(self.inner.peer_stats(&peer))
    }

    pub fn all_peer_stats(&self) -> Vec<PeerStats> {
        let peers: Vec<_> = self.inner.table.read().iter().cloned().collect();
        peers.iter().map(|p| self.inner.peer_stats(p)).collect()
    }

    pub fn handler_stats(&self) -> Vec<HandlerStats> {
        let handlers = self.inner.handlers.read();
        handlers
            .iter()
            .enumerate()
            .filter_map(|(usertype, slot)| {
                slot.as_ref().map(|h| HandlerStats {
                    usertype: usertype as u32,
                    name: h.name.clone(),
                    calls: h.calls.load(Ordering::Relaxed),
                    total_us: h.total_us.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    /// Walk a peer's pending frames. User payloads are run through the
    /// getlsn hook when one is registered.
    pub fn dump_queue(&self, host: &str) -> Result<Vec<QueueFrameInfo>, SendError> {
        let peer = self.inner.lookup(host).ok_or(SendError::InvalidNode)?;
        let getlsn = self.inner.hook_getlsn();
        let now = now_ms();
        let q = peer.queue.lock();
        Ok(q.iter()
            .map(|frame| QueueFrameInfo {
                typ: frame.typ as i32,
                len: frame.buf.len(),
                age_ms: now.saturating_sub(frame.enq_ms),
                lsn: getlsn.as_ref().and_then(|hook| frame.body().and_then(|b| hook(b))),
            })
            .collect())
    }

    // ---- watchlist ----

    /// Watch an appsock for read/write idleness; expired sockets are shut
    /// down by the liveness checker. Pass a `try_clone` of the stream the
    /// host keeps using.
    pub fn watch_socket(
        &self,
        sock: TcpStream,
        read_idle: Option<Duration>,
        write_idle: Option<Duration>,
    ) -> WatchId {
        watchlist::watch(&self.inner, sock, read_idle, write_idle)
    }

    pub fn watch_touch_read(&self, id: WatchId) {
        watchlist::touch_read(&self.inner, id);
    }

    pub fn watch_touch_write(&self, id: WatchId) {
        watchlist::touch_write(&self.inner, id);
    }

    pub fn unwatch_socket(&self, id: WatchId) {
        watchlist::unwatch(&self.inner, id);
    }

    // ---- tunables ----

    pub fn set_max_queue(&self, v: usize) {
        self.inner.tunables.set_max_queue(v);
    }

    pub fn set_max_bytes(&self, v: usize) {
        self.inner.tunables.set_max_bytes(v);
    }

    pub fn set_heartbeat_send_ms(&self, v: u64) {
        self.inner.tunables.set_heartbeat_send_ms(v);
    }

    pub fn set_heartbeat_check_ms(&self, v: u64) {
        self.inner.tunables.set_heartbeat_check_ms(v);
    }

    pub fn set_throttle_pct(&self, v: usize) {
        self.inner.tunables.set_throttle_pct(v);
    }

    pub fn set_portmux_register_ms(&self, v: u64) {
        self.inner.tunables.set_portmux_register_ms(v);
    }

    pub fn set_reorder_lookahead(&self, v: usize) {
        self.inner.tunables.set_reorder_lookahead(v);
    }

    pub fn set_flush_interval(&self, v: u32) {
        self.inner.tunables.set_flush_interval(v);
    }

    pub fn set_sock_buf_size(&self, v: usize) {
        self.inner.tunables.set_sock_buf_size(v);
    }

    pub fn set_netpoll_ms(&self, v: u64) {
        self.inner.tunables.set_netpoll_ms(v);
    }
}
