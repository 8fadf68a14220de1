use std::{
    net::TcpListener,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use crate::hooks::TlsPolicy;

/// Static configuration for one mesh. Everything here is fixed for the mesh
/// lifetime; runtime-settable knobs live in [`Tunables`].
pub struct MeshConfig {
    /// Service triple used for name-service (portmux) resolution and
    /// registration.
    pub app: String,
    pub service: String,
    pub instance: String,
    /// Our own hostname. Canonicalized (ASCII-lowercased) on mesh creation;
    /// always present in the peer table, never a valid send target.
    pub hostname: String,
    /// TCP port we listen on and advertise. Zero means resolve through the
    /// name service at start.
    pub port: u16,
    /// Handler table size; user types are `0..max_user_type`.
    pub max_user_type: usize,
    /// Pre-bound listen socket handed in by the host, typically to guard
    /// against double-launch. When absent the mesh binds `0.0.0.0:port`.
    pub listener: Option<TcpListener>,
    pub tls_policy: TlsPolicy,
}

impl MeshConfig {
    pub fn new(
        app: impl Into<String>,
        service: impl Into<String>,
        instance: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            app: app.into(),
            service: service.into(),
            instance: instance.into(),
            hostname: hostname.into(),
            port,
            max_user_type: 256,
            listener: None,
            tls_policy: TlsPolicy::Disabled,
        }
    }
}

macro_rules! tunable {
    ($atomic:ty, $get:ident, $set:ident) => {
        pub(crate) fn $get(&self) -> <$atomic as AtomicValue>::Value {
            self.$get.load(Ordering::Relaxed)
        }
        pub(crate) fn $set(&self, v: <$atomic as AtomicValue>::Value) {
            self.$get.store(v, Ordering::Relaxed);
        }
    };
}

pub(crate) trait AtomicValue {
    type Value;
    fn load(&self, order: Ordering) -> Self::Value;
    fn store(&self, v: Self::Value, order: Ordering);
}

macro_rules! impl_atomic_value {
    ($atomic:ty, $value:ty) => {
        impl AtomicValue for $atomic {
            type Value = $value;
            fn load(&self, order: Ordering) -> $value {
                <$atomic>::load(self, order)
            }
            fn store(&self, v: $value, order: Ordering) {
                <$atomic>::store(self, v, order)
            }
        }
    };
}

impl_atomic_value!(AtomicUsize, usize);
impl_atomic_value!(AtomicU64, u64);
impl_atomic_value!(AtomicU32, u32);

/// Runtime-settable knobs, all relaxed atomics. Field names double as the
/// getter names; `set_*` are the setters.
pub(crate) struct Tunables {
    max_queue: AtomicUsize,
    max_bytes: AtomicUsize,
    heartbeat_send_ms: AtomicU64,
    heartbeat_check_ms: AtomicU64,
    throttle_pct: AtomicUsize,
    portmux_register_ms: AtomicU64,
    reorder_lookahead: AtomicUsize,
    flush_interval: AtomicU32,
    sock_buf_size: AtomicUsize,
    netpoll_ms: AtomicU64,
    writer_poll_ms: AtomicU64,
    user_msg_buf: AtomicUsize,
    max_body: AtomicUsize,
    subnet_blackout_ms: AtomicU64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_queue: AtomicUsize::new(10_000),
            max_bytes: AtomicUsize::new(0),
            heartbeat_send_ms: AtomicU64::new(5_000),
            heartbeat_check_ms: AtomicU64::new(10_000),
            throttle_pct: AtomicUsize::new(50),
            portmux_register_ms: AtomicU64::new(600_000),
            reorder_lookahead: AtomicUsize::new(20),
            flush_interval: AtomicU32::new(1_000),
            sock_buf_size: AtomicUsize::new(0),
            netpoll_ms: AtomicU64::new(100),
            writer_poll_ms: AtomicU64::new(1_000),
            user_msg_buf: AtomicUsize::new(256 * 1024),
            max_body: AtomicUsize::new(256 * 1024 * 1024),
            subnet_blackout_ms: AtomicU64::new(10_000),
        }
    }
}

impl Tunables {
    tunable!(AtomicUsize, max_queue, set_max_queue);
    tunable!(AtomicUsize, max_bytes, set_max_bytes);
    tunable!(AtomicU64, heartbeat_send_ms, set_heartbeat_send_ms);
    tunable!(AtomicU64, heartbeat_check_ms, set_heartbeat_check_ms);
    tunable!(AtomicUsize, throttle_pct, set_throttle_pct);
    tunable!(AtomicU64, portmux_register_ms, set_portmux_register_ms);
    tunable!(AtomicUsize, reorder_lookahead, set_reorder_lookahead);
    tunable!(AtomicU32, flush_interval, set_flush_interval);
    tunable!(AtomicUsize, sock_buf_size, set_sock_buf_size);
    tunable!(AtomicU64, netpoll_ms, set_netpoll_ms);
    tunable!(AtomicU64, writer_poll_ms, set_writer_poll_ms);
    tunable!(AtomicUsize, user_msg_buf, set_user_msg_buf);
    tunable!(AtomicUsize, max_body, set_max_body);
    tunable!(AtomicU64, subnet_blackout_ms, set_subnet_blackout_ms);
}
