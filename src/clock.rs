//! Monotonic clock (C7).
//!
//! Injected everywhere ordering depends on "now" so tests can drive
//! deterministic tie-breaking when two orders would otherwise land in the
//! same millisecond.

use std::sync::atomic::{AtomicI64, Ordering};

/// A source of monotonically non-decreasing millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds. Never returns a value smaller than a
    /// previous call on the same instance.
    fn now_millis(&self) -> i64;
}

/// Wall-clock implementation, clamped so repeated calls within the same
/// millisecond (or a backwards NTP step) never go backwards.
#[derive(Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1).max(prev);
            let candidate = if wall > prev { wall } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(observed) => {
                    prev = observed;
                    let _ = next;
                }
            }
        }
    }
}

/// Deterministic clock for tests: every call advances by one tick unless a
/// caller sets an explicit time.
pub struct TestClock {
    current: AtomicI64,
}

impl TestClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            current: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.current.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.current.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> i64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = TestClock::new(1_000);
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b > a);
    }

    #[test]
    fn system_clock_never_goes_backwards() {
        let clock = SystemClock::new();
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }
}
