//! Sliding window pacing: a rolling record of admission timestamps within
//! the trailing window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::base::{secs_to_wait_ms, Effective, Pacing, EPSILON};
use crate::config::{Algorithm, LimiterConfig};
use crate::headers::HeaderHints;

/// Per-key admission log, oldest first.
///
/// A deque keeps the oldest entry at the front, so expiry and wait-time
/// checks never scan the whole log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SlidingWindowState {
    pub timestamps: VecDeque<f64>,
    #[serde(default)]
    pub last_request: Option<f64>,
}

pub(crate) struct SlidingWindow;

impl SlidingWindow {
    /// Admissions allowed inside the trailing window: `floor(rate * window)`,
    /// never below one.
    fn window_limit(eff: &Effective) -> u32 {
        let raw = (eff.rate * eff.window_secs + EPSILON).floor();
        if raw < 1.0 {
            1
        } else if raw >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            raw as u32
        }
    }

    fn occupancy(state: &SlidingWindowState) -> u32 {
        u32::try_from(state.timestamps.len()).unwrap_or(u32::MAX)
    }
}

impl Pacing for SlidingWindow {
    const ALGORITHM: Algorithm = Algorithm::SlidingWindow;
    const SLEEP_CAP: Duration = Duration::from_secs(2);
    const LEGACY_STATE_KEY: &'static str = "windows";

    type State = SlidingWindowState;

    fn seed(_eff: &Effective, _now: f64) -> Self::State {
        SlidingWindowState {
            timestamps: VecDeque::new(),
            last_request: None,
        }
    }

    fn advance(state: &mut Self::State, eff: &Effective, now: f64) {
        let horizon = now - eff.window_secs;
        while state
            .timestamps
            .front()
            .is_some_and(|&oldest| oldest <= horizon)
        {
            state.timestamps.pop_front();
        }
    }

    fn admit(state: &mut Self::State, permits: u32, eff: &Effective, now: f64) -> bool {
        let limit = Self::window_limit(eff);
        let Some(next) = Self::occupancy(state).checked_add(permits) else {
            return false;
        };
        if next > limit {
            return false;
        }
        for _ in 0..permits {
            state.timestamps.push_back(now);
        }
        state.last_request = Some(now);
        true
    }

    fn wait_ms(state: &Self::State, eff: &Effective, now: f64) -> u64 {
        if Self::occupancy(state) < Self::window_limit(eff) {
            return 0;
        }
        state.timestamps.front().map_or(0, |&oldest| {
            secs_to_wait_ms(oldest + eff.window_secs - now)
        })
    }

    fn raw_status(state: &Self::State, eff: &Effective) -> Value {
        json!({
            "count": Self::occupancy(state),
            "limit": Self::window_limit(eff),
            "oldest": state.timestamps.front(),
            "newest": state.timestamps.back(),
            "last_request": state.last_request,
        })
    }

    fn usage_percent(state: &Self::State, eff: &Effective) -> f64 {
        let limit = Self::window_limit(eff);
        if limit == 0 {
            return 100.0;
        }
        f64::from(Self::occupancy(state)) / f64::from(limit) * 100.0
    }

    fn is_dormant(state: &Self::State, cutoff: f64, _eff: &Effective, _now: f64) -> bool {
        state
            .timestamps
            .back()
            .is_none_or(|&newest| newest < cutoff)
            && state.last_request.is_none_or(|at| at < cutoff)
    }

    fn reconcile(
        state: &mut Self::State,
        key: &str,
        hints: &HeaderHints,
        cfg: &LimiterConfig,
        overlay: &mut HashMap<String, f64>,
        now: f64,
    ) {
        if let Some(limit) = hints.limit {
            // Stored as a rate so the overlay stays uniform; the window
            // limit derived from it is floor(limit * safety_buffer).
            overlay.insert(
                key.to_string(),
                limit * cfg.safety_buffer / cfg.window_secs(),
            );
        }

        if let Some(remaining) = hints.remaining {
            let eff = crate::base::effective_for::<Self>(cfg, overlay, key);
            let limit = Self::window_limit(&eff);
            let server_remaining = remaining.min(f64::from(limit)) as u32;
            let occupancy = Self::occupancy(state);
            let implied = limit - server_remaining;

            // Only ever add load; the server's view never frees local slots.
            if implied > occupancy {
                let missing = implied - occupancy;
                // Phantom admissions land just before `now`, 1 ms apart, so
                // the log stays ordered and they expire in sequence.
                let floor = state.timestamps.back().copied().unwrap_or(f64::MIN);
                for i in 0..missing {
                    let offset = f64::from(missing - 1 - i) * 0.001;
                    state.timestamps.push_back((now - offset).max(floor));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::base::KeyedLimiter;
    use crate::clock::ManualClock;

    fn limiter(
        rate: f64,
        burst: u32,
        window: Duration,
        clock: &ManualClock,
    ) -> KeyedLimiter<SlidingWindow> {
        let cfg = LimiterConfig::new(Algorithm::SlidingWindow, rate, burst)
            .with_safety_buffer(1.0)
            .with_window(window);
        KeyedLimiter::open(cfg, None, Arc::new(clock.clone())).unwrap()
    }

    #[test]
    fn admissions_roll_off_with_the_window() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 5, Duration::from_secs(1), &clock);

        for i in 0..5 {
            assert!(limiter.is_allowed_n("api", 1), "request {i} within limit");
        }
        assert!(!limiter.is_allowed_n("api", 1));

        // Whole window elapses: the log is empty again.
        clock.advance(1.001);
        let status = limiter.status("api");
        assert_eq!(status.raw["count"], 0);
        assert!(limiter.is_allowed_n("api", 5));
    }

    #[test]
    fn partial_expiry_frees_partial_room() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(3.0, 3, Duration::from_secs(1), &clock);

        assert!(limiter.is_allowed_n("api", 2));
        clock.advance(0.5);
        assert!(limiter.is_allowed_n("api", 1));
        assert!(!limiter.is_allowed_n("api", 1));

        // The first two roll off at t=1.0; the third stays.
        clock.advance(0.501);
        assert!(limiter.is_allowed_n("api", 2));
        assert!(!limiter.is_allowed_n("api", 1));
    }

    #[test]
    fn wait_time_tracks_oldest_admission() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(2.0, 2, Duration::from_secs(1), &clock);

        assert!(limiter.is_allowed_n("api", 2));
        clock.advance(0.3);
        assert_eq!(limiter.wait_time("api"), Duration::from_millis(700));
    }

    #[test]
    fn remaining_header_adds_phantom_admissions() {
        let clock = ManualClock::new(100.0);
        let limiter = limiter(1.0, 60, Duration::from_secs(60), &clock);

        for _ in 0..10 {
            assert!(limiter.is_allowed_n("api", 1));
        }

        let headers = HashMap::from([("x-ratelimit-remaining".to_string(), "30".to_string())]);
        limiter.update_from_headers("api", &headers);

        let status = limiter.status("api");
        assert_eq!(status.raw["count"], 30);
        // Phantoms never run ahead of the clock.
        assert!(status.raw["newest"].as_f64().unwrap() <= 100.0 + 1e-9);

        // A roomier server view never drops local admissions.
        let headers = HashMap::from([("x-ratelimit-remaining".to_string(), "55".to_string())]);
        limiter.update_from_headers("api", &headers);
        assert_eq!(limiter.status("api").raw["count"], 30);
    }

    #[test]
    fn limit_header_tightens_window_limit() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(1.0, 60, Duration::from_secs(60), &clock);

        let headers = HashMap::from([("x-ratelimit-limit".to_string(), "10".to_string())]);
        limiter.update_from_headers("api", &headers);

        assert!(limiter.is_allowed_n("api", 10));
        assert!(!limiter.is_allowed_n("api", 1));
    }

    #[test]
    fn denial_leaves_log_unchanged() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(2.0, 2, Duration::from_secs(1), &clock);

        assert!(limiter.is_allowed_n("api", 1));
        let before = limiter.status("api").raw["count"].clone();
        assert!(!limiter.is_allowed_n("api", 2));
        assert_eq!(limiter.status("api").raw["count"], before);
    }

    #[test]
    fn bulk_admission_records_every_permit() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(10.0, 10, Duration::from_secs(1), &clock);

        assert!(limiter.is_allowed_n("api", 4));
        assert_eq!(limiter.status("api").raw["count"], 4);
    }

    #[test]
    fn dormancy_follows_newest_timestamp() {
        let clock = ManualClock::new(0.0);
        let limiter = limiter(5.0, 5, Duration::from_secs(1), &clock);

        assert!(limiter.is_allowed_n("old", 1));
        clock.advance(7_200.0);
        assert!(limiter.is_allowed_n("fresh", 1));

        assert_eq!(limiter.cleanup(Duration::from_secs(3_600)), 1);
        let statuses = limiter.all_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].key, "fresh");
    }
}
