//! Shared per-key lifecycle behind the four pacing algorithms.
//!
//! [`KeyedLimiter`] owns the state map, the dynamic-limits overlay and the
//! dirty flag under a single lock, loads and flushes snapshots through the
//! state store, and delegates the per-algorithm math to the [`Pacing`]
//! hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{Algorithm, LimiterConfig};
use crate::error::RateLimitError;
use crate::headers::HeaderHints;
use crate::status::KeyStatus;
use crate::store::{SharedCache, Snapshot, StateStore};
use crate::RateLimiter;

/// Wait reported when no effective rate can make a request admissible.
pub(crate) const WAIT_FALLBACK_MS: u64 = 30_000;

/// Slack for float comparisons in admission math.
pub(crate) const EPSILON: f64 = 1e-9;

/// Effective admission parameters for one key at one instant: the dynamic
/// overlay for the key wins, then a per-endpoint override derated by the
/// safety buffer, then the configured default derated the same way.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Effective {
    /// Admissions per second, post-overlay and post-safety-buffer.
    pub rate: f64,
    /// Configured burst capacity.
    pub burst: u32,
    /// Window length in fractional seconds.
    pub window_secs: f64,
}

/// Per-algorithm hooks the shared lifecycle drives.
pub(crate) trait Pacing: Send + Sync + 'static {
    const ALGORITHM: Algorithm;
    /// Upper bound for a single sleep inside `wait_for_allowed`.
    const SLEEP_CAP: Duration;
    /// Top-level name this algorithm's persisted state map used in the
    /// older file layout.
    const LEGACY_STATE_KEY: &'static str;

    type State: Clone + Serialize + DeserializeOwned + Send + 'static;

    /// Fresh state for a key at first touch: full admission capacity.
    fn seed(eff: &Effective, now: f64) -> Self::State;

    /// Refill, leak, window-reset or expire. Negative elapsed intervals are
    /// clamped to zero; timestamps still move to `now`.
    fn advance(state: &mut Self::State, eff: &Effective, now: f64);

    /// Charge `permits` if admissible. No mutation on denial.
    fn admit(state: &mut Self::State, permits: u32, eff: &Effective, now: f64) -> bool;

    /// Milliseconds until a single-permit request would pass; `advance` has
    /// already run for `now`.
    fn wait_ms(state: &Self::State, eff: &Effective, now: f64) -> u64;

    /// Algorithm-specific raw status fields.
    fn raw_status(state: &Self::State, eff: &Effective) -> Value;

    /// Share of effective capacity in use, 0..=100.
    fn usage_percent(state: &Self::State, eff: &Effective) -> f64;

    /// Whether the key qualifies for dormancy reclamation at `cutoff`.
    fn is_dormant(state: &Self::State, cutoff: f64, eff: &Effective, now: f64) -> bool;

    /// Fold authoritative server hints into local state and the overlay.
    fn reconcile(
        state: &mut Self::State,
        key: &str,
        hints: &HeaderHints,
        cfg: &LimiterConfig,
        overlay: &mut HashMap<String, f64>,
        now: f64,
    );

    /// Hook for algorithms whose effective rate folds in extra overlay
    /// entries (the fixed window's daily/hourly projections).
    fn clamp_rate(_key: &str, _overlay: &HashMap<String, f64>, rate: f64) -> f64 {
        rate
    }
}

/// Compute the effective parameters for `key` under the precedence rules.
/// Overlay entries are stored post-safety-buffer and are not derated again.
pub(crate) fn effective_for<P: Pacing>(
    cfg: &LimiterConfig,
    overlay: &HashMap<String, f64>,
    key: &str,
) -> Effective {
    let rate = overlay.get(key).copied().unwrap_or_else(|| {
        let base = cfg
            .endpoint_limits
            .get(key)
            .copied()
            .unwrap_or(cfg.rate_per_second);
        base * cfg.safety_buffer
    });
    let rate = P::clamp_rate(key, overlay, rate);
    Effective {
        rate,
        burst: cfg.burst_capacity,
        window_secs: cfg.window_secs(),
    }
}

struct Inner<S> {
    states: HashMap<String, S>,
    dynamic_limits: HashMap<String, f64>,
    dirty: bool,
}

/// Generic limiter: one algorithm, many keys, one lock.
pub(crate) struct KeyedLimiter<P: Pacing> {
    cfg: LimiterConfig,
    clock: Arc<dyn Clock>,
    store: Option<StateStore>,
    inner: Mutex<Inner<P::State>>,
}

impl<P: Pacing> KeyedLimiter<P> {
    /// Validate the configuration, pick a persistence backend, load any
    /// stored snapshot and prune keys that went dormant while the process
    /// was down.
    pub(crate) fn open(
        cfg: LimiterConfig,
        cache: Option<Arc<dyn SharedCache>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        cfg.validate()?;
        let store = StateStore::open(&cfg, cache, P::LEGACY_STATE_KEY);
        let limiter = Self {
            cfg,
            clock,
            store,
            inner: Mutex::new(Inner {
                states: HashMap::new(),
                dynamic_limits: HashMap::new(),
                dirty: false,
            }),
        };
        limiter.load();
        Ok(limiter)
    }

    fn load(&self) {
        let Some(store) = &self.store else { return };
        let Some(snapshot) = store.load() else { return };

        {
            let mut guard = self.inner.lock();
            for (key, value) in snapshot.state {
                match serde_json::from_value::<P::State>(value) {
                    Ok(state) => {
                        guard.states.insert(key, state);
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "dropping unreadable persisted key state");
                    }
                }
            }
            guard.dynamic_limits = snapshot.dynamic_limits;
        }

        let removed = self.cleanup(Duration::from_secs(self.cfg.cleanup_interval_secs));
        if removed > 0 {
            debug!(removed, "pruned dormant keys while loading state");
        }
    }

    pub(crate) fn is_allowed_n(&self, key: &str, permits: u32) -> bool {
        let permits = permits.max(1);
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let eff = effective_for::<P>(&self.cfg, &inner.dynamic_limits, key);
        let created = !inner.states.contains_key(key);
        let state = inner
            .states
            .entry(key.to_string())
            .or_insert_with(|| P::seed(&eff, now));
        P::advance(state, &eff, now);

        let admitted = P::admit(state, permits, &eff, now);
        if admitted || created {
            inner.dirty = true;
        }
        if !admitted {
            debug!(key, permits, algorithm = %P::ALGORITHM, "admission denied");
        }
        admitted
    }

    pub(crate) async fn wait_until_allowed(
        &self,
        key: &str,
        permits: u32,
        max_wait: Duration,
    ) -> bool {
        let start = Instant::now();
        loop {
            if self.is_allowed_n(key, permits) {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return false;
            }
            // Bounded naps: never longer than the algorithm cap or the
            // remaining budget, never shorter than 1 ms.
            let wait = self
                .wait_time(key)
                .min(P::SLEEP_CAP)
                .max(Duration::from_millis(1))
                .min(max_wait - elapsed);
            tokio::time::sleep(wait).await;
        }
    }

    pub(crate) fn wait_time(&self, key: &str) -> Duration {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let eff = effective_for::<P>(&self.cfg, &inner.dynamic_limits, key);
        let created = !inner.states.contains_key(key);
        let state = inner
            .states
            .entry(key.to_string())
            .or_insert_with(|| P::seed(&eff, now));
        P::advance(state, &eff, now);
        if created {
            inner.dirty = true;
        }

        let ms = if eff.rate > 0.0 {
            P::wait_ms(state, &eff, now)
        } else {
            WAIT_FALLBACK_MS
        };
        Duration::from_millis(ms)
    }

    pub(crate) fn reset(&self, key: &str) {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let eff = effective_for::<P>(&self.cfg, &inner.dynamic_limits, key);
        inner.states.insert(key.to_string(), P::seed(&eff, now));
        inner.dirty = true;
    }

    pub(crate) fn reset_all(&self) {
        let mut guard = self.inner.lock();
        guard.states.clear();
        guard.dynamic_limits.clear();
        guard.dirty = true;
    }

    fn status_locked(cfg: &LimiterConfig, inner: &mut Inner<P::State>, key: &str, now: f64) -> KeyStatus {
        let eff = effective_for::<P>(cfg, &inner.dynamic_limits, key);
        let created = !inner.states.contains_key(key);
        let state = inner
            .states
            .entry(key.to_string())
            .or_insert_with(|| P::seed(&eff, now));
        P::advance(state, &eff, now);
        if created {
            inner.dirty = true;
        }

        let wait_ms = if eff.rate > 0.0 {
            P::wait_ms(state, &eff, now)
        } else {
            WAIT_FALLBACK_MS
        };
        KeyStatus {
            algorithm: P::ALGORITHM,
            key: key.to_string(),
            limited: wait_ms > 0,
            wait_ms,
            usage_percent: P::usage_percent(state, &eff).clamp(0.0, 100.0),
            raw: P::raw_status(state, &eff),
        }
    }

    pub(crate) fn status(&self, key: &str) -> KeyStatus {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        Self::status_locked(&self.cfg, &mut guard, key, now)
    }

    pub(crate) fn all_statuses(&self) -> Vec<KeyStatus> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let mut keys: Vec<String> = guard.states.keys().cloned().collect();
        keys.sort_unstable();
        keys.into_iter()
            .map(|key| Self::status_locked(&self.cfg, &mut guard, &key, now))
            .collect()
    }

    pub(crate) fn cleanup(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let cutoff = now - max_age.as_secs_f64();
        let mut guard = self.inner.lock();
        let Inner {
            states,
            dynamic_limits,
            dirty,
        } = &mut *guard;

        let before = states.len();
        let cfg = &self.cfg;
        states.retain(|key, state| {
            let eff = effective_for::<P>(cfg, dynamic_limits, key);
            !P::is_dormant(state, cutoff, &eff, now)
        });
        let removed = before - states.len();
        if removed > 0 {
            *dirty = true;
            debug!(removed, algorithm = %P::ALGORITHM, "reclaimed dormant keys");
        }
        removed
    }

    pub(crate) fn update_from_headers(&self, key: &str, headers: &HashMap<String, String>) {
        let hints = HeaderHints::read(headers, &self.cfg);
        if hints.is_empty() {
            return;
        }
        if let Some(reset) = hints.reset {
            debug!(key, reset, "server reset hint observed");
        }

        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let Inner {
            states,
            dynamic_limits,
            dirty,
        } = &mut *guard;

        let eff = effective_for::<P>(&self.cfg, dynamic_limits, key);
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| P::seed(&eff, now));
        P::advance(state, &eff, now);
        P::reconcile(state, key, &hints, &self.cfg, dynamic_limits, now);
        *dirty = true;
    }

    pub(crate) fn flush_state(&self) {
        let Some(store) = &self.store else { return };
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let snapshot = Self::snapshot_locked(&guard, now);
        store.save(&snapshot);
        guard.dirty = false;
    }

    fn snapshot_locked(inner: &Inner<P::State>, now: f64) -> Snapshot {
        let mut state = Map::new();
        for (key, value) in &inner.states {
            match serde_json::to_value(value) {
                Ok(encoded) => {
                    state.insert(key.clone(), encoded);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unserializable key state");
                }
            }
        }
        Snapshot {
            state,
            dynamic_limits: inner.dynamic_limits.clone(),
            timestamp: now,
        }
    }
}

impl<P: Pacing> Drop for KeyedLimiter<P> {
    /// Teardown flush: the coalesced writes land when the limiter goes
    /// away, without any process-global shutdown hook.
    fn drop(&mut self) {
        let Some(store) = &self.store else { return };
        let inner = self.inner.get_mut();
        if inner.dirty {
            store.save(&Self::snapshot_locked(inner, self.clock.now()));
        }
    }
}

#[async_trait]
impl<P: Pacing> RateLimiter for KeyedLimiter<P> {
    fn algorithm(&self) -> Algorithm {
        P::ALGORITHM
    }

    fn is_allowed_n(&self, key: &str, permits: u32) -> bool {
        Self::is_allowed_n(self, key, permits)
    }

    async fn wait_for_allowed(&self, key: &str, permits: u32, max_wait: Duration) -> bool {
        self.wait_until_allowed(key, permits, max_wait).await
    }

    fn wait_time(&self, key: &str) -> Duration {
        Self::wait_time(self, key)
    }

    fn reset(&self, key: &str) {
        Self::reset(self, key);
    }

    fn reset_all(&self) {
        Self::reset_all(self);
    }

    fn status(&self, key: &str) -> KeyStatus {
        Self::status(self, key)
    }

    fn all_statuses(&self) -> Vec<KeyStatus> {
        Self::all_statuses(self)
    }

    fn cleanup(&self, max_age: Duration) -> usize {
        Self::cleanup(self, max_age)
    }

    fn update_from_headers(&self, key: &str, headers: &HashMap<String, String>) {
        Self::update_from_headers(self, key, headers);
    }

    fn flush_state(&self) {
        Self::flush_state(self);
    }
}

/// Round a fractional second interval up to whole milliseconds.
pub(crate) fn secs_to_wait_ms(secs: f64) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    let ms = (secs * 1_000.0).ceil();
    if ms >= u64::MAX as f64 {
        u64::MAX
    } else {
        ms as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_ms_rounds_up() {
        assert_eq!(secs_to_wait_ms(0.0), 0);
        assert_eq!(secs_to_wait_ms(-1.0), 0);
        assert_eq!(secs_to_wait_ms(0.0001), 1);
        assert_eq!(secs_to_wait_ms(1.0), 1_000);
        assert_eq!(secs_to_wait_ms(1.2345), 1_235);
    }
}
