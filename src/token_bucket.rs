//! Token bucket pacing: burst-capable admission with continuous refill.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::base::{secs_to_wait_ms, Effective, Pacing, EPSILON, WAIT_FALLBACK_MS};
use crate::config::{Algorithm, LimiterConfig};
use crate::headers::HeaderHints;

/// Per-key token bucket state.
///
/// `capacity` starts at the configured burst capacity and can only be
/// lowered, by a server limit header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TokenBucketState {
    pub tokens: f64,
    pub capacity: u32,
    pub last_refill: f64,
    #[serde(default)]
    pub last_request: Option<f64>,
}

pub(crate) struct TokenBucket;

impl Pacing for TokenBucket {
    const ALGORITHM: Algorithm = Algorithm::TokenBucket;
    const SLEEP_CAP: Duration = Duration::from_secs(1);
    const LEGACY_STATE_KEY: &'static str = "buckets";

    type State = TokenBucketState;

    fn seed(eff: &Effective, now: f64) -> Self::State {
        // Capacity is the burst capacity, full stop. Folding the rate in
        // here would let a 100/s limiter burst 100 deep through a bucket
        // configured for 10.
        TokenBucketState {
            tokens: f64::from(eff.burst),
            capacity: eff.burst,
            last_refill: now,
            last_request: None,
        }
    }

    fn advance(state: &mut Self::State, eff: &Effective, now: f64) {
        let elapsed = (now - state.last_refill).max(0.0);
        if eff.rate > 0.0 {
            state.tokens = (state.tokens + elapsed * eff.rate).min(f64::from(state.capacity));
        }
        state.last_refill = now;
    }

    fn admit(state: &mut Self::State, permits: u32, _eff: &Effective, now: f64) -> bool {
        let cost = f64::from(permits);
        if state.tokens + EPSILON < cost {
            return false;
        }
        state.tokens = (state.tokens - cost).max(0.0);
        state.last_request = Some(now);
        true
    }

    fn wait_ms(state: &Self::State, eff: &Effective, _now: f64) -> u64 {
        if state.tokens + EPSILON >= 1.0 {
            return 0;
        }
        if eff.rate <= 0.0 {
            return WAIT_FALLBACK_MS;
        }
        secs_to_wait_ms((1.0 - state.tokens) / eff.rate)
    }

    fn raw_status(state: &Self::State, eff: &Effective) -> Value {
        json!({
            "tokens": state.tokens,
            "capacity": state.capacity,
            "rate": eff.rate,
            "last_refill": state.last_refill,
            "last_request": state.last_request,
        })
    }

    fn usage_percent(state: &Self::State, _eff: &Effective) -> f64 {
        if state.capacity == 0 {
            return 100.0;
        }
        (1.0 - state.tokens / f64::from(state.capacity)) * 100.0
    }

    fn is_dormant(state: &Self::State, cutoff: f64, _eff: &Effective, _now: f64) -> bool {
        state.last_refill < cutoff && state.last_request.is_none_or(|at| at < cutoff)
    }

    fn reconcile(
        state: &mut Self::State,
        key: &str,
        hints: &HeaderHints,
        cfg: &LimiterConfig,
        overlay: &mut HashMap<String, f64>,
        _now: f64,
    ) {
        if let Some(limit) = hints.limit {
            overlay.insert(key.to_string(), limit * cfg.safety_buffer);
            // The integer header value caps the bucket; never raised.
            let header_capacity = limit.min(f64::from(u32::MAX)) as u32;
            state.capacity = state.capacity.min(header_capacity);
            state.tokens = state.tokens.min(f64::from(state.capacity));
        }
        if let Some(remaining) = hints.remaining {
            state.tokens = state.tokens.min(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::base::KeyedLimiter;
    use crate::clock::ManualClock;

    fn limiter(rate: f64, burst: u32, clock: &ManualClock) -> KeyedLimiter<TokenBucket> {
        let cfg = LimiterConfig::new(Algorithm::TokenBucket, rate, burst).with_safety_buffer(1.0);
        KeyedLimiter::open(cfg, None, Arc::new(clock.clone())).unwrap()
    }

    #[test]
    fn burst_then_refill() {
        let clock = ManualClock::new(1_000.0);
        let limiter = limiter(5.0, 10, &clock);

        for i in 0..10 {
            assert!(limiter.is_allowed_n("api", 1), "request {i} within burst");
        }
        assert!(!limiter.is_allowed_n("api", 1));

        clock.advance(1.0);
        for i in 0..5 {
            assert!(limiter.is_allowed_n("api", 1), "request {i} after refill");
        }
        assert!(!limiter.is_allowed_n("api", 1));
    }

    #[test]
    fn capacity_is_burst_not_rate() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(100.0, 10, &clock);

        let status = limiter.status("api");
        assert_eq!(status.raw["capacity"], 10);
        assert!((status.raw["tokens"].as_f64().unwrap() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn refill_never_overshoots_capacity() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 10, &clock);

        assert!(limiter.is_allowed_n("api", 3));
        clock.advance(100.0);
        let status = limiter.status("api");
        assert!((status.raw["tokens"].as_f64().unwrap() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn denial_does_not_charge() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 10, &clock);

        assert!(limiter.is_allowed_n("api", 8));
        let before = limiter.status("api").raw["tokens"].as_f64().unwrap();
        assert!(!limiter.is_allowed_n("api", 5));
        let after = limiter.status("api").raw["tokens"].as_f64().unwrap();
        assert!((before - after).abs() < 1e-9);
    }

    #[test]
    fn oversized_request_is_denied_with_bounded_wait() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 10, &clock);

        assert!(!limiter.is_allowed_n("api", 11));
        assert!(limiter.wait_time("api") <= Duration::from_millis(WAIT_FALLBACK_MS));
    }

    #[test]
    fn wait_time_matches_deficit() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(2.0, 4, &clock);

        for _ in 0..4 {
            assert!(limiter.is_allowed_n("api", 1));
        }
        // Empty bucket at 2 tokens/s: one token in 500 ms.
        assert_eq!(limiter.wait_time("api"), Duration::from_millis(500));
    }

    #[test]
    fn clock_regression_is_clamped() {
        let clock = ManualClock::new(1_000.0);
        let limiter = limiter(5.0, 10, &clock);

        for _ in 0..10 {
            assert!(limiter.is_allowed_n("api", 1));
        }
        clock.set(900.0);
        assert!(!limiter.is_allowed_n("api", 1));
        let status = limiter.status("api");
        assert!(status.raw["tokens"].as_f64().unwrap() < 1.0);
    }

    #[test]
    fn limit_header_lowers_capacity_and_rate() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(10.0, 20, &clock);

        let headers = HashMap::from([("x-ratelimit-limit".to_string(), "5".to_string())]);
        limiter.update_from_headers("api", &headers);

        let status = limiter.status("api");
        assert_eq!(status.raw["capacity"], 5);
        assert!(status.raw["tokens"].as_f64().unwrap() <= 5.0);
        assert!((status.raw["rate"].as_f64().unwrap() - 5.0).abs() < 1e-9);

        // A later, higher limit never raises the capacity back.
        let headers = HashMap::from([("x-ratelimit-limit".to_string(), "50".to_string())]);
        limiter.update_from_headers("api", &headers);
        assert_eq!(limiter.status("api").raw["capacity"], 5);
    }

    #[test]
    fn remaining_header_only_shrinks_tokens() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(10.0, 10, &clock);

        assert!(limiter.is_allowed_n("api", 2));
        let headers = HashMap::from([("x-ratelimit-remaining".to_string(), "3".to_string())]);
        limiter.update_from_headers("api", &headers);
        assert!((limiter.status("api").raw["tokens"].as_f64().unwrap() - 3.0).abs() < 1e-9);

        let headers = HashMap::from([("x-ratelimit-remaining".to_string(), "9".to_string())]);
        limiter.update_from_headers("api", &headers);
        assert!(limiter.status("api").raw["tokens"].as_f64().unwrap() <= 3.0 + 1e-9);
    }

    #[test]
    fn keys_are_independent() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 2, &clock);

        assert!(limiter.is_allowed_n("a", 2));
        assert!(!limiter.is_allowed_n("a", 1));
        assert!(limiter.is_allowed_n("b", 1));
    }

    #[test]
    fn reset_restores_full_burst() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 10, &clock);

        for _ in 0..10 {
            assert!(limiter.is_allowed_n("api", 1));
        }
        limiter.reset("api");
        assert!(limiter.is_allowed_n("api", 10));
    }

    #[test]
    fn dormant_keys_are_reclaimed() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 10, &clock);

        assert!(limiter.is_allowed_n("old", 1));
        clock.advance(7_200.0);
        assert!(limiter.is_allowed_n("fresh", 1));

        assert_eq!(limiter.cleanup(Duration::from_secs(3_600)), 1);
        assert_eq!(limiter.all_statuses().len(), 1);
        assert_eq!(limiter.all_statuses()[0].key, "fresh");
    }
}
