use std::{
    cmp::Ordering as CmpOrdering,
    io,
    net::TcpStream,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{ack::AckHandle, peer::PeerId};

/// Admission check run on accept before a connecting hostname is admitted to
/// the mesh. Returning false drops the connection.
pub type AllowHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Host-level liveness oracle (rtcpu). When registered, the dial loop skips
/// attempts toward hostnames it reports down.
pub type MachineUpHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Notification hooks taking the affected peer's hostname: new-node,
/// host-down, hello.
pub type NodeHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Extracts an ordering key (an LSN in the replication stack) from a user
/// payload. Used only by queue-dump introspection.
pub type GetLsnHook = Arc<dyn Fn(&[u8]) -> Option<u64> + Send + Sync>;

/// Comparator over user payloads backing in-order enqueues.
pub type NetCmpHook = Arc<dyn Fn(&[u8], &[u8]) -> CmpOrdering + Send + Sync>;

/// Receives a non-mesh ("appsock") connection peeled off the accept path,
/// together with the peeked (still unconsumed) first byte.
pub type AppsockHook = Arc<dyn Fn(TcpStream, u8) + Send + Sync>;

/// Called at the start/end of every thread the mesh spawns, with the thread
/// role name. Lets the host do caller-side thread-local setup.
pub type ThreadHook = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Name service ("portmux") the mesh resolves and registers through.
pub trait NameService: Send + Sync {
    /// Resolve the TCP port for a service triple.
    fn resolve(&self, app: &str, service: &str, instance: &str) -> io::Result<u16>;
    /// (Re-)register our triple at `port`; returns the port the service has
    /// on record. A divergent answer is fatal to the process.
    fn register(&self, app: &str, service: &str, instance: &str, port: u16) -> io::Result<u16>;
}

/// Pluggable TLS negotiation over the raw socket. The transport never does
/// crypto of its own; the hook is expected to handshake in place (e.g. kTLS
/// or authenticate-then-clear) and leave the fd usable for plain reads and
/// writes.
pub trait TlsHook: Send + Sync {
    fn connect(&self, sock: &TcpStream, peer: &str) -> io::Result<()>;
    fn accept(&self, sock: &TcpStream) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsPolicy {
    #[default]
    Disabled,
    /// Accept TLS when the peer requests it.
    Allow,
    /// Require TLS on every mesh connection.
    Require,
}

/// Queue observer for introspection tooling. Callbacks fire inside the queue
/// paths; implementations must not call back into the mesh.
pub trait QstatHook: Send + Sync {
    fn init(&self, host: &str);
    fn enqueue(&self, host: &str, typ: i32, len: usize);
    fn reader(&self, host: &str, typ: i32, len: usize);
    fn clear(&self, host: &str);
    fn free(&self, host: &str);
}

/// Everything registered by the host, read under the mesh hook lock and
/// cloned out before use.
#[derive(Default)]
pub(crate) struct HookSet {
    pub allow: Option<AllowHook>,
    pub machine_up: Option<MachineUpHook>,
    pub new_node: Option<NodeHook>,
    pub host_down: Option<NodeHook>,
    pub hello: Option<NodeHook>,
    pub getlsn: Option<GetLsnHook>,
    pub netcmp: Option<NetCmpHook>,
    pub qstat: Option<Arc<dyn QstatHook>>,
    pub appsock: Option<AppsockHook>,
    pub admin_appsock: Option<AppsockHook>,
    pub thread_start: Option<ThreadHook>,
    pub thread_stop: Option<ThreadHook>,
    pub name_service: Option<Arc<dyn NameService>>,
    pub tls: Option<Arc<dyn TlsHook>>,
}

/// Context handed to a registered user-type handler.
///
/// `body` is only valid for the duration of the call; it aliases the
/// reader's scratch buffer.
pub struct HandlerCtx<'a> {
    pub from: &'a str,
    pub from_id: PeerId,
    pub usertype: u32,
    pub body: &'a [u8],
    pub(crate) ack: Option<AckHandle>,
}

impl HandlerCtx<'_> {
    /// Take the ack handle when the sender asked for an acknowledgement.
    /// A handler that drops the handle without acking leaves the sender to
    /// time out.
    pub fn take_ack(&mut self) -> Option<AckHandle> {
        self.ack.take()
    }
}

pub(crate) type HandlerFn = Arc<dyn Fn(&mut HandlerCtx<'_>) + Send + Sync>;

/// One registered user type: the function plus its call counters.
pub(crate) struct Handler {
    pub name: String,
    pub func: HandlerFn,
    pub calls: AtomicU64,
    pub total_us: AtomicU64,
}

impl Handler {
    pub(crate) fn new(name: &str, func: HandlerFn) -> Self {
        Self {
            name: name.to_owned(),
            func,
            calls: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_call(&self, micros: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(micros, Ordering::Relaxed);
    }
}
