//! four-ratelimit - client-side rate limiting for API clients
//!
//! This crate keeps outbound request flows inside a remote service's rate
//! limits before the service has to say no:
//!
//! - **Algorithms**: token bucket, leaky bucket, fixed window, sliding
//!   window, behind one [`RateLimiter`] contract
//! - **State**: per-key state with file or shared-cache persistence,
//!   atomic writes and dormant-key cleanup
//! - **Reconciliation**: response headers (`limit`, `remaining`, daily and
//!   hourly quotas) fold back into the local model, always conservatively
//! - **Middleware**: pre-admission, reconciliation and 429 backoff around a
//!   caller-supplied send function
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use four_ratelimit::{build_limiter, Algorithm, LimiterConfig};
//!
//! // 5 requests per second with bursts of 10, derated by the default
//! // safety buffer.
//! let cfg = LimiterConfig::new(Algorithm::TokenBucket, 5.0, 10);
//! let limiter = build_limiter(cfg, None)?;
//!
//! if limiter.is_allowed("search") {
//!     // issue the request, then feed the response headers back:
//!     // limiter.update_from_headers("search", &headers);
//! } else {
//!     let wait = limiter.wait_time("search");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

mod backoff;
mod base;
mod clock;
mod config;
mod error;
mod fixed_window;
mod headers;
mod leaky_bucket;
mod middleware;
mod sliding_window;
mod status;
mod store;
mod token_bucket;

pub use backoff::ExponentialBackoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Algorithm, HeaderField, LimiterConfig};
pub use error::{CacheError, MiddlewareError, RateLimitError};
pub use headers::{flatten_headers, parse_retry_after};
pub use middleware::{PacedResponse, RateLimitMiddleware};
pub use status::KeyStatus;
pub use store::SharedCache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::base::KeyedLimiter;
use crate::fixed_window::FixedWindow;
use crate::leaky_bucket::LeakyBucket;
use crate::sliding_window::SlidingWindow;
use crate::token_bucket::TokenBucket;

/// Uniform contract over the four pacing algorithms.
///
/// Every operation initializes a key's state on first touch. Only
/// [`wait_for_allowed`](RateLimiter::wait_for_allowed) blocks; everything
/// else is a short critical section.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Which algorithm this limiter runs.
    fn algorithm(&self) -> Algorithm;

    /// Admit-or-deny for a single token.
    fn is_allowed(&self, key: &str) -> bool {
        self.is_allowed_n(key, 1)
    }

    /// Admit-or-deny for `permits` tokens, atomically: either all are
    /// charged or none. Zero permits are treated as one. Requests above the
    /// effective capacity are always denied.
    fn is_allowed_n(&self, key: &str, permits: u32) -> bool;

    /// Repeatedly attempt admission, sleeping between attempts, until one
    /// succeeds or `max_wait` wall time has passed. Single sleeps are
    /// bounded per algorithm (1-2 s) with a 1 ms floor; 30 s is the
    /// conventional budget when the caller has no deadline of its own.
    async fn wait_for_allowed(&self, key: &str, permits: u32, max_wait: Duration) -> bool;

    /// Time until a single-token request would pass; zero when admissible
    /// now, 30 s when no effective rate can ever free a slot.
    fn wait_time(&self, key: &str) -> Duration;

    /// Restore the key to its initial, fully-admissible state.
    fn reset(&self, key: &str);

    /// Drop every key's state and every dynamic limit.
    fn reset_all(&self);

    /// Snapshot one key, refreshed to the present time.
    fn status(&self, key: &str) -> KeyStatus;

    /// [`status`](RateLimiter::status) flattened into a JSON object.
    fn status_map(&self, key: &str) -> Map<String, Value> {
        self.status(key).to_map()
    }

    /// Snapshot every tracked key.
    fn all_statuses(&self) -> Vec<KeyStatus>;

    /// [`all_statuses`](RateLimiter::all_statuses) in map form.
    fn all_status_maps(&self) -> Vec<Map<String, Value>> {
        self.all_statuses().iter().map(KeyStatus::to_map).collect()
    }

    /// Reclaim keys idle for longer than `max_age` (an hour, typically;
    /// load-time cleanup uses the configured interval); returns how many
    /// were removed.
    fn cleanup(&self, max_age: Duration) -> usize;

    /// Fold a server response's rate limit headers into the local model.
    /// Availability only ever moves toward the server's view, never past it.
    fn update_from_headers(&self, key: &str, headers: &HashMap<String, String>);

    /// Write the current state through the configured backend. Writes are
    /// otherwise coalesced behind a dirty flag and flushed at teardown.
    fn flush_state(&self);
}

/// Build a limiter for the configured algorithm.
///
/// When `cache` is given and persistence is enabled, state lives under a
/// single derived cache key; otherwise the configured state file is used.
///
/// # Errors
/// Returns [`RateLimitError::InvalidConfig`] when the configuration fails
/// validation.
pub fn build_limiter(
    cfg: LimiterConfig,
    cache: Option<Arc<dyn SharedCache>>,
) -> Result<Arc<dyn RateLimiter>, RateLimitError> {
    build_limiter_with_clock(cfg, cache, Arc::new(SystemClock))
}

/// [`build_limiter`] with an explicit time source, for tests and callers
/// that virtualize time.
///
/// # Errors
/// Returns [`RateLimitError::InvalidConfig`] when the configuration fails
/// validation.
pub fn build_limiter_with_clock(
    cfg: LimiterConfig,
    cache: Option<Arc<dyn SharedCache>>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RateLimiter>, RateLimitError> {
    Ok(match cfg.algorithm {
        Algorithm::TokenBucket => Arc::new(KeyedLimiter::<TokenBucket>::open(cfg, cache, clock)?),
        Algorithm::LeakyBucket => Arc::new(KeyedLimiter::<LeakyBucket>::open(cfg, cache, clock)?),
        Algorithm::FixedWindow => Arc::new(KeyedLimiter::<FixedWindow>::open(cfg, cache, clock)?),
        Algorithm::SlidingWindow => {
            Arc::new(KeyedLimiter::<SlidingWindow>::open(cfg, cache, clock)?)
        }
    })
}
