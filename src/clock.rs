//! Time source abstraction for refill, leak and window math.
//!
//! Per-key state survives process restarts, so timestamps are wall-clock
//! epoch seconds rather than process-local monotonic readings. Elapsed
//! intervals are clamped to zero wherever they are consumed, which covers
//! clock regression.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Thread-safe source of wall-clock epoch seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as fractional seconds since the UNIX epoch.
    fn now(&self) -> f64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Hand-driven clock for tests.
///
/// Clones share the same reading, so a limiter under test and the test body
/// observe the same advances.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock reading `start` epoch seconds.
    #[must_use]
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    /// Set the clock to an absolute reading. Moving backwards is allowed;
    /// consumers clamp negative elapsed intervals to zero.
    pub fn set(&self, epoch_secs: f64) {
        *self.now.lock() = epoch_secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_non_decreasing() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_clones_share_reading() {
        let clock = ManualClock::new(1_000.0);
        let clone = clock.clone();
        clock.advance(5.0);
        assert!((clone.now() - 1_005.0).abs() < f64::EPSILON);
    }

    #[test]
    fn trait_object_usage() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.0));
        assert!(clock.now().abs() < f64::EPSILON);
    }
}
