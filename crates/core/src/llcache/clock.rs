//! Time sources for freshness and scheduling.

use std::cell::Cell;
use std::time::Instant;

/// Wall-clock and monotonic time.
pub trait Clock {
    /// Wall-clock seconds since the Unix epoch.
    fn now(&self) -> i64;

    /// Monotonic milliseconds from an arbitrary origin.
    fn monotonic_ms(&self) -> u64;
}

/// The system clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: Cell<u64>,
    epoch: Cell<i64>,
}

impl ManualClock {
    /// A clock reading `epoch` seconds.
    pub fn new(epoch: i64) -> Self {
        Self { millis: Cell::new(0), epoch: Cell::new(epoch) }
    }

    /// Move both readings forward by whole seconds.
    pub fn advance(&self, secs: i64) {
        self.advance_ms(u64::try_from(secs.max(0)).unwrap_or(0) * 1000);
    }

    /// Move both readings forward by milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        let before = self.millis.get();
        let after = before + ms;
        self.millis.set(after);
        let whole = i64::try_from(after / 1000 - before / 1000).unwrap_or(i64::MAX);
        self.epoch.set(self.epoch.get() + whole);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.epoch.get()
    }

    fn monotonic_ms(&self) -> u64 {
        self.millis.get()
    }
}
