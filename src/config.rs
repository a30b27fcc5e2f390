//! Limiter configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;

/// Pacing algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Burst-capable admission with continuous refill.
    TokenBucket,
    /// Smooth admission; fill on admit, drain at a constant rate.
    LeakyBucket,
    /// Counter per discrete window, hard reset at the boundary.
    FixedWindow,
    /// Rolling count of admission timestamps within a trailing window.
    SlidingWindow,
}

impl Algorithm {
    /// The literal tag used in configuration and status output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::LeakyBucket => "leaky_bucket",
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
        }
    }

    /// Short prefix used in persistence cache keys.
    #[must_use]
    pub(crate) const fn prefix(self) -> &'static str {
        match self {
            Self::TokenBucket => "tb",
            Self::LeakyBucket => "lb",
            Self::FixedWindow => "fw",
            Self::SlidingWindow => "sw",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_bucket" => Ok(Self::TokenBucket),
            "leaky_bucket" => Ok(Self::LeakyBucket),
            "fixed_window" => Ok(Self::FixedWindow),
            "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(RateLimitError::InvalidConfig(format!(
                "unsupported algorithm: {other}"
            ))),
        }
    }
}

/// Internal names for the response-header fields a limiter understands.
///
/// Configuration maps each of these to the header name the remote service
/// actually sends. Lookups are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderField {
    /// Allowed requests; interpreted as a rate (token/leaky bucket) or a
    /// window limit (sliding window).
    Limit,
    /// Requests the server still allows in the current window.
    Remaining,
    /// Seconds or timestamp until the server-side window resets.
    Reset,
    /// Seconds to wait after a 429.
    RetryAfter,
    /// Requests allowed per day (fixed window).
    DailyLimit,
    /// Requests allowed per hour (fixed window).
    HourlyLimit,
    /// Requests remaining today (fixed window).
    DailyRemaining,
}

/// Immutable parameter bundle for one limiter.
///
/// Built with [`LimiterConfig::new`] and the `with_*` methods; validated when
/// the limiter is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Pacing algorithm.
    pub algorithm: Algorithm,

    /// Steady-state admissions per second, before the safety buffer.
    pub rate_per_second: f64,

    /// Maximum tokens or requests admissible in one burst.
    pub burst_capacity: u32,

    /// Derating factor in (0, 1] applied to every effective rate, configured
    /// or header-derived.
    pub safety_buffer: f64,

    /// Per-key rate overrides (pre-safety-buffer).
    #[serde(default)]
    pub endpoint_limits: HashMap<String, f64>,

    /// Internal field name to response header name.
    #[serde(default)]
    pub header_mappings: HashMap<HeaderField, String>,

    /// Window length for the window-based algorithms, in milliseconds.
    pub window_size_ms: u64,

    /// Whether state is loaded and saved across the process lifetime.
    #[serde(default)]
    pub persist_state: bool,

    /// Target path for the file backend.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Age in seconds after which a dormant key may be reclaimed.
    pub cleanup_interval_secs: u64,
}

impl LimiterConfig {
    /// Create a configuration with the library defaults: safety buffer 0.8,
    /// 1 s window, cleanup after an hour, no persistence.
    ///
    /// Header mappings default to the conventional lowercase names
    /// (`x-ratelimit-limit`, `x-ratelimit-remaining`, `x-ratelimit-reset`,
    /// `retry-after`), which is what HTTP clients that normalize header
    /// casing produce.
    #[must_use]
    pub fn new(algorithm: Algorithm, rate_per_second: f64, burst_capacity: u32) -> Self {
        let header_mappings = [
            (HeaderField::Limit, "x-ratelimit-limit"),
            (HeaderField::Remaining, "x-ratelimit-remaining"),
            (HeaderField::Reset, "x-ratelimit-reset"),
            (HeaderField::RetryAfter, "retry-after"),
        ]
        .into_iter()
        .map(|(field, name)| (field, name.to_string()))
        .collect();

        Self {
            algorithm,
            rate_per_second,
            burst_capacity,
            safety_buffer: 0.8,
            endpoint_limits: HashMap::new(),
            header_mappings,
            window_size_ms: 1_000,
            persist_state: false,
            state_file: None,
            cleanup_interval_secs: 3_600,
        }
    }

    /// Set the safety buffer.
    #[must_use]
    pub fn with_safety_buffer(mut self, safety_buffer: f64) -> Self {
        self.safety_buffer = safety_buffer;
        self
    }

    /// Add a per-key rate override (pre-safety-buffer).
    #[must_use]
    pub fn with_endpoint_limit(mut self, key: impl Into<String>, rate_per_second: f64) -> Self {
        self.endpoint_limits.insert(key.into(), rate_per_second);
        self
    }

    /// Map an internal header field to the name the remote service uses.
    #[must_use]
    pub fn with_header_mapping(mut self, field: HeaderField, header: impl Into<String>) -> Self {
        self.header_mappings.insert(field, header.into());
        self
    }

    /// Set the window length for the window-based algorithms.
    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window_size_ms = window.as_millis() as u64;
        self
    }

    /// Enable persistence to a state file.
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_state = true;
        self.state_file = Some(path.into());
        self
    }

    /// Enable or disable persistence without changing the target.
    #[must_use]
    pub const fn with_persist_state(mut self, persist: bool) -> Self {
        self.persist_state = persist;
        self
    }

    /// Set the dormancy cutoff used by automatic cleanup.
    #[must_use]
    pub const fn with_cleanup_interval(mut self, secs: u64) -> Self {
        self.cleanup_interval_secs = secs;
        self
    }

    /// Check every numeric constraint.
    ///
    /// # Errors
    /// Returns [`RateLimitError::InvalidConfig`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if !(self.rate_per_second > 0.0 && self.rate_per_second.is_finite()) {
            return Err(RateLimitError::InvalidConfig(format!(
                "rate_per_second must be positive, got {}",
                self.rate_per_second
            )));
        }
        if self.burst_capacity < 1 {
            return Err(RateLimitError::InvalidConfig(
                "burst_capacity must be at least 1".into(),
            ));
        }
        if !(self.safety_buffer > 0.0 && self.safety_buffer <= 1.0) {
            return Err(RateLimitError::InvalidConfig(format!(
                "safety_buffer must be in (0, 1], got {}",
                self.safety_buffer
            )));
        }
        if self.window_size_ms == 0 {
            return Err(RateLimitError::InvalidConfig(
                "window_size_ms must be positive".into(),
            ));
        }
        if self.cleanup_interval_secs < 1 {
            return Err(RateLimitError::InvalidConfig(
                "cleanup_interval_secs must be at least 1".into(),
            ));
        }
        for (key, rate) in &self.endpoint_limits {
            if !(*rate > 0.0 && rate.is_finite()) {
                return Err(RateLimitError::InvalidConfig(format!(
                    "endpoint limit for {key} must be positive, got {rate}"
                )));
            }
        }
        Ok(())
    }

    /// Window length in fractional seconds.
    #[must_use]
    pub(crate) fn window_secs(&self) -> f64 {
        self.window_size_ms as f64 / 1_000.0
    }
}
