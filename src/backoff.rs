//! Exponential backoff used by the HTTP middleware's 429 handling.

use std::time::Duration;

/// Deterministic exponential backoff: `initial * multiplier^(attempt - 1)`,
/// capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Delay for the first attempt.
    pub initial: Duration,

    /// Upper bound for any single delay.
    pub max: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl ExponentialBackoff {
    /// Create a backoff with the default doubling multiplier.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay for the given attempt, counted from 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(30));

        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn caps_at_max() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(30));

        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert_eq!(backoff.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn custom_multiplier() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_multiplier(3.0);

        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(3));
        assert_eq!(backoff.delay(3), Duration::from_secs(9));
    }
}
