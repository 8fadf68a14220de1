//! Multi-subnet dial rotation.
//!
//! A host may carry DNS suffixes (e.g. `_n2`, `_n3`) selecting a dedicated
//! NIC for the dial target. Suffixes are process-wide: every mesh in the
//! process rotates over the same list. Each dial picks the next suffix
//! round-robin, skipping entries recently marked bad and entries an
//! operator disabled.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{mesh, stats::SubnetStatus};

struct SubnetEntry {
    suffix: String,
    bad_until: Option<Instant>,
    disabled: bool,
}

struct Rotation {
    entries: Vec<SubnetEntry>,
    next: usize,
}

static ROTATION: Lazy<Mutex<Rotation>> =
    Lazy::new(|| Mutex::new(Rotation { entries: Vec::new(), next: 0 }));

/// Register a dial suffix. Idempotent on the suffix string.
pub fn add_suffix(suffix: &str) {
    let mut rot = ROTATION.lock();
    if rot.entries.iter().any(|e| e.suffix == suffix) {
        return;
    }
    info!(suffix, "subnet suffix registered");
    rot.entries.push(SubnetEntry { suffix: suffix.to_owned(), bad_until: None, disabled: false });
}

/// Administratively disable a suffix and synchronously shut down every open
/// socket dialed through it, across all meshes in the process.
pub fn disable_suffix(suffix: &str) {
    let idx = {
        let mut rot = ROTATION.lock();
        let Some(idx) = rot.entries.iter().position(|e| e.suffix == suffix) else {
            return;
        };
        rot.entries[idx].disabled = true;
        idx
    };
    warn!(suffix, "subnet disabled, closing its sockets");
    mesh::close_sockets_on_subnet(idx);
}

/// Re-enable a previously disabled suffix.
pub fn enable_suffix(suffix: &str) {
    let mut rot = ROTATION.lock();
    if let Some(e) = rot.entries.iter_mut().find(|e| e.suffix == suffix) {
        e.disabled = false;
        e.bad_until = None;
    }
}

/// Current status of every registered suffix.
pub fn status() -> Vec<SubnetStatus> {
    let rot = ROTATION.lock();
    rot.entries
        .iter()
        .map(|e| SubnetStatus {
            suffix: e.suffix.clone(),
            disabled: e.disabled,
            blacked_out_ms: e.bad_until.and_then(|t| {
                let left = t.saturating_duration_since(Instant::now());
                (!left.is_zero()).then(|| left.as_millis() as u64)
            }),
        })
        .collect()
}

/// Mark a suffix bad for `blackout`; the rotation skips it until then. The
/// liveness checker calls this when a socket dialed through the suffix goes
/// silent.
pub(crate) fn mark_bad(idx: usize, blackout: Duration) {
    let mut rot = ROTATION.lock();
    if let Some(e) = rot.entries.get_mut(idx) {
        warn!(suffix = %e.suffix, ?blackout, "marking subnet bad");
        e.bad_until = Some(Instant::now() + blackout);
    }
}

/// Next dial target for `host`: the suffixed hostname plus the suffix index
/// used (None when dialing the bare name). Falls back to the bare name when
/// every suffix is bad or disabled.
pub(crate) fn next_dial_target(host: &str) -> (String, Option<usize>) {
    let mut rot = ROTATION.lock();
    let n = rot.entries.len();
    if n == 0 {
        return (host.to_owned(), None);
    }
    let now = Instant::now();
    for step in 0..n {
        let idx = (rot.next + step) % n;
        let usable = {
            let e = &rot.entries[idx];
            !e.disabled && !e.bad_until.is_some_and(|t| t > now)
        };
        if !usable {
            continue;
        }
        rot.next = (idx + 1) % n;
        return (format!("{host}{}", rot.entries[idx].suffix), Some(idx));
    }
    (host.to_owned(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The rotation is process-global, so this single test exercises the
    // whole lifecycle to avoid cross-test interference.
    #[test]
    fn rotation_skips_bad_and_disabled() {
        add_suffix("_t1");
        add_suffix("_t2");
        add_suffix("_t1"); // idempotent

        let (a, ia) = next_dial_target("host");
        let (b, ib) = next_dial_target("host");
        assert_ne!(a, b);
        assert!(a.starts_with("host_t"));
        assert!(b.starts_with("host_t"));
        let (ia, ib) = (ia.unwrap(), ib.unwrap());

        mark_bad(ia, Duration::from_secs(60));
        for _ in 0..4 {
            let (t, idx) = next_dial_target("host");
            assert_eq!(idx, Some(ib), "rotation must skip the blacked-out suffix");
            assert_eq!(t, b);
        }

        let st = status();
        assert!(st.iter().any(|s| s.blacked_out_ms.is_some()));

        // disabling the remaining suffix leaves only the bare name
        let suffix_b = st[ib].suffix.clone();
        disable_suffix(&suffix_b);
        let (t, idx) = next_dial_target("host");
        assert_eq!(idx, None);
        assert_eq!(t, "host");

        enable_suffix(&suffix_b);
        let (_, idx) = next_dial_target("host");
        assert_eq!(idx, Some(ib));
    }
}
