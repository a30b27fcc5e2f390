//! Fixed window pacing: a counter per discrete window, hard reset at the
//! boundary.
//!
//! Up to twice the steady rate can land around a boundary (the tail of one
//! window plus the head of the next). That clustering is the algorithm's
//! contract; callers who need smooth pacing pick the sliding window.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::base::{secs_to_wait_ms, Effective, Pacing, EPSILON};
use crate::config::{Algorithm, LimiterConfig};
use crate::headers::HeaderHints;

const SECS_PER_DAY: f64 = 86_400.0;
const SECS_PER_HOUR: f64 = 3_600.0;

/// Per-key window counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FixedWindowState {
    pub count: u32,
    pub window_start: f64,
    pub window_end: f64,
    #[serde(default)]
    pub last_request: Option<f64>,
}

pub(crate) struct FixedWindow;

impl FixedWindow {
    /// Admissions allowed inside one window: `ceil(rate * window)`, never
    /// below one.
    fn window_limit(eff: &Effective) -> u32 {
        let raw = (eff.rate * eff.window_secs - EPSILON).ceil();
        if raw < 1.0 {
            1
        } else if raw >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            raw as u32
        }
    }
}

impl Pacing for FixedWindow {
    const ALGORITHM: Algorithm = Algorithm::FixedWindow;
    const SLEEP_CAP: Duration = Duration::from_secs(2);
    const LEGACY_STATE_KEY: &'static str = "windows";

    type State = FixedWindowState;

    fn seed(eff: &Effective, now: f64) -> Self::State {
        FixedWindowState {
            count: 0,
            window_start: now,
            window_end: now + eff.window_secs,
            last_request: None,
        }
    }

    fn advance(state: &mut Self::State, eff: &Effective, now: f64) {
        if now >= state.window_end {
            state.window_start = now;
            state.window_end = now + eff.window_secs;
            state.count = 0;
        }
    }

    fn admit(state: &mut Self::State, permits: u32, eff: &Effective, now: f64) -> bool {
        let limit = Self::window_limit(eff);
        let Some(next) = state.count.checked_add(permits) else {
            return false;
        };
        if next > limit {
            return false;
        }
        state.count = next;
        state.last_request = Some(now);
        true
    }

    fn wait_ms(state: &Self::State, eff: &Effective, now: f64) -> u64 {
        if state.count < Self::window_limit(eff) {
            return 0;
        }
        secs_to_wait_ms(state.window_end - now)
    }

    fn raw_status(state: &Self::State, eff: &Effective) -> Value {
        json!({
            "count": state.count,
            "limit": Self::window_limit(eff),
            "window_start": state.window_start,
            "window_end": state.window_end,
            "last_request": state.last_request,
        })
    }

    fn usage_percent(state: &Self::State, eff: &Effective) -> f64 {
        let limit = Self::window_limit(eff);
        if limit == 0 {
            return 100.0;
        }
        f64::from(state.count) / f64::from(limit) * 100.0
    }

    fn is_dormant(state: &Self::State, cutoff: f64, _eff: &Effective, _now: f64) -> bool {
        state.window_end < cutoff && state.last_request.is_none_or(|at| at < cutoff)
    }

    fn reconcile(
        state: &mut Self::State,
        key: &str,
        hints: &HeaderHints,
        cfg: &LimiterConfig,
        overlay: &mut HashMap<String, f64>,
        _now: f64,
    ) {
        if let Some(daily) = hints.daily_limit {
            overlay.insert(
                format!("{key}_daily"),
                daily / SECS_PER_DAY * cfg.safety_buffer,
            );
        }
        if let Some(hourly) = hints.hourly_limit {
            overlay.insert(
                format!("{key}_hourly"),
                hourly / SECS_PER_HOUR * cfg.safety_buffer,
            );
        }

        // Limits may have tightened above; re-derive before projecting
        // remaining counts onto the window.
        let eff = crate::base::effective_for::<Self>(cfg, overlay, key);
        let limit = Self::window_limit(&eff);

        if let Some(remaining) = hints.remaining {
            let server_remaining = remaining.min(f64::from(limit)) as u32;
            state.count = state.count.max(limit - server_remaining);
        }
        if let Some(daily_remaining) = hints.daily_remaining {
            // Share of today's leftover quota that fits this window.
            let projected = daily_remaining * eff.window_secs / SECS_PER_DAY;
            let allowed = projected.min(f64::from(limit)) as u32;
            state.count = state.count.max(limit - allowed);
        }
    }

    fn clamp_rate(key: &str, overlay: &HashMap<String, f64>, rate: f64) -> f64 {
        let mut rate = rate;
        for suffix in ["_daily", "_hourly"] {
            if let Some(cap) = overlay.get(&format!("{key}{suffix}")) {
                rate = rate.min(*cap);
            }
        }
        rate
    }
}
