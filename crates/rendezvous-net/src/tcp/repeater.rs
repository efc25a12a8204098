use std::time::{Duration, Instant};

/// Fires at most once per `interval`. Mirrors the interval-gated retry
/// pattern used elsewhere in this stack, built on `std::time` rather than a
/// shared global clock since the reconnect cadence here has no need for one.
pub(crate) struct Repeater {
    interval: Duration,
    last_fired: Instant,
}

impl Repeater {
    pub(crate) fn every(interval: Duration) -> Self {
        Self { interval, last_fired: Instant::now() - interval }
    }

    /// Returns `true` (and resets the gate) if `interval` has elapsed since
    /// the last fire.
    pub(crate) fn fired(&mut self) -> bool {
        if self.last_fired.elapsed() >= self.interval {
            self.last_fired = Instant::now();
            true
        } else {
            false
        }
    }

    pub(crate) fn force_fire(&mut self) {
        self.last_fired = Instant::now() - self.interval;
    }
}
