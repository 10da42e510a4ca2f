//! Drift-free tick scheduling for periodic producers.

use std::time::Duration;
use tokio::time::Instant;

/// Schedules ticks at `anchor + k * interval`.
///
/// Work done between ticks never pushes later ticks back. If a tick is
/// missed entirely, the pacer skips ahead to the next future slot instead of
/// bursting to catch up.
#[derive(Debug, Clone)]
pub struct Pacer {
    next: Instant,
    interval: Duration,
}

impl Pacer {
    /// First tick fires at `anchor`.
    pub fn new(anchor: Instant, interval: Duration) -> Self {
        Self {
            next: anchor,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Deadline of the upcoming tick.
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Advance past the tick that just fired, skipping any slots already
    /// behind `now`.
    pub fn advance(&mut self, now: Instant) -> Instant {
        self.next += self.interval;
        if self.next <= now {
            let behind = now.duration_since(self.next);
            let skipped = behind.as_nanos() / self.interval.as_nanos() + 1;
            self.next += self.interval * skipped as u32;
        }
        self.next
    }
}
