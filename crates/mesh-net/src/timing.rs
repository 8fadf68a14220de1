use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since the first call in this process. Cheap enough
/// for per-frame timestamps (last-rx, queue age).
pub(crate) fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Fires at most once per interval. First call to `fired` after construction
/// fires immediately.
pub(crate) struct Repeater {
    interval: Duration,
    last: Option<Instant>,
}

impl Repeater {
    pub(crate) fn every(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub(crate) fn fired(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < self.interval => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

/// Sleep up to `total`, polling `stop` every 100 ms so shutdown and decom are
/// honored before any long block.
pub(crate) fn sleep_unless<F: Fn() -> bool>(total: Duration, stop: F) {
    const STEP: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    while !stop() {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };
        std::thread::sleep(left.min(STEP));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeater_fires_immediately_then_waits() {
        let mut rep = Repeater::every(Duration::from_secs(60));
        assert!(rep.fired());
        assert!(!rep.fired());
    }

    #[test]
    fn sleep_unless_stops_early() {
        let t0 = Instant::now();
        sleep_unless(Duration::from_secs(10), || true);
        assert!(t0.elapsed() < Duration::from_secs(1));
    }
}
