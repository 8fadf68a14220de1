use std::sync::atomic::{AtomicU64, Ordering};

use crate::peer::PeerId;

/// Lock-free per-peer byte/wait counters. Queue-side counters (dedupe, full,
/// reorder, peaks) live under the queue mutex and are merged into
/// [`PeerStats`] at snapshot time.
#[derive(Default)]
pub(crate) struct PeerCounters {
    pub bytes_tx: AtomicU64,
    pub bytes_rx: AtomicU64,
    pub throttle_waits: AtomicU64,
}

impl PeerCounters {
    pub(crate) fn add_tx(&self, n: u64) {
        self.bytes_tx.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_rx(&self, n: u64) {
        self.bytes_rx.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of one peer.
#[derive(Clone, Debug)]
pub struct PeerStats {
    pub name: String,
    pub id: PeerId,
    pub connected: bool,
    pub got_hello: bool,
    pub sanctioned: bool,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub throttle_waits: u64,
    pub queue_count: usize,
    pub queue_bytes: usize,
    pub peak_queue_count: usize,
    pub peak_queue_bytes: usize,
    pub dedupe_count: u64,
    pub queue_full_count: u64,
    pub reorder_count: u64,
    pub distress: u32,
    /// Milliseconds since the last inbound byte, if ever seen.
    pub last_rx_age_ms: Option<u64>,
}

/// Per-usertype handler counters.
#[derive(Clone, Debug)]
pub struct HandlerStats {
    pub usertype: u32,
    pub name: String,
    pub calls: u64,
    pub total_us: u64,
}

/// Node counts for quorum math.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshCounts {
    pub total: usize,
    pub connected: usize,
    pub sanctioned: usize,
    pub sanctioned_connected: usize,
}

/// One pending frame from a queue dump.
#[derive(Clone, Debug)]
pub struct QueueFrameInfo {
    pub typ: i32,
    pub len: usize,
    pub age_ms: u64,
    /// Present for user messages when a getlsn hook is registered and
    /// recognizes the payload.
    pub lsn: Option<u64>,
}

/// Status of one configured subnet suffix.
#[derive(Clone, Debug)]
pub struct SubnetStatus {
    pub suffix: String,
    pub disabled: bool,
    /// Remaining blackout, when the suffix was recently marked bad.
    pub blacked_out_ms: Option<u64>,
}
