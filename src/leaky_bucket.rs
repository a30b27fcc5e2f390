//! Leaky bucket pacing: fill on admit, drain at the effective rate.
//!
//! The bucket starts empty, so the first burst up to capacity is admitted
//! without waiting; sustained traffic then smooths to the drain rate.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::base::{secs_to_wait_ms, Effective, Pacing, EPSILON, WAIT_FALLBACK_MS};
use crate::config::{Algorithm, LimiterConfig};
use crate::headers::HeaderHints;

/// Per-key water level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LeakyBucketState {
    pub level: f64,
    pub last_leak: f64,
    #[serde(default)]
    pub last_request: Option<f64>,
}

pub(crate) struct LeakyBucket;

impl LeakyBucket {
    fn drained(state: &LeakyBucketState, rate: f64, now: f64) -> f64 {
        let elapsed = (now - state.last_leak).max(0.0);
        (state.level - elapsed * rate.max(0.0)).max(0.0)
    }
}

impl Pacing for LeakyBucket {
    const ALGORITHM: Algorithm = Algorithm::LeakyBucket;
    const SLEEP_CAP: Duration = Duration::from_secs(1);
    const LEGACY_STATE_KEY: &'static str = "buckets";

    type State = LeakyBucketState;

    fn seed(_eff: &Effective, now: f64) -> Self::State {
        LeakyBucketState {
            level: 0.0,
            last_leak: now,
            last_request: None,
        }
    }

    fn advance(state: &mut Self::State, eff: &Effective, now: f64) {
        state.level = Self::drained(state, eff.rate, now);
        // Move the mark even when the bucket is already dry, otherwise an
        // idle key accumulates leak credit it never earned.
        state.last_leak = now;
    }

    fn admit(state: &mut Self::State, permits: u32, eff: &Effective, now: f64) -> bool {
        let cost = f64::from(permits);
        if state.level + cost > f64::from(eff.burst) + EPSILON {
            return false;
        }
        state.level += cost;
        state.last_request = Some(now);
        true
    }

    fn wait_ms(state: &Self::State, eff: &Effective, _now: f64) -> u64 {
        let space = f64::from(eff.burst) - state.level;
        if space + EPSILON >= 1.0 {
            return 0;
        }
        if eff.rate <= 0.0 {
            return WAIT_FALLBACK_MS;
        }
        secs_to_wait_ms((1.0 - space) / eff.rate)
    }

    fn raw_status(state: &Self::State, eff: &Effective) -> Value {
        json!({
            "level": state.level,
            "capacity": eff.burst,
            "rate": eff.rate,
            "last_leak": state.last_leak,
            "last_request": state.last_request,
        })
    }

    fn usage_percent(state: &Self::State, eff: &Effective) -> f64 {
        if eff.burst == 0 {
            return 100.0;
        }
        state.level / f64::from(eff.burst) * 100.0
    }

    fn is_dormant(state: &Self::State, cutoff: f64, eff: &Effective, now: f64) -> bool {
        state.last_leak < cutoff
            && state.last_request.is_none_or(|at| at < cutoff)
            && Self::drained(state, eff.rate, now) <= EPSILON
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
        }
        if let Some(remaining) = hints.remaining {
            // Less room on the server means more water here, never less.
            let implied = f64::from(cfg.burst_capacity) - remaining;
            state.level = state
                .level
                .max(implied)
                .clamp(0.0, f64::from(cfg.burst_capacity));
        }
    }
}
