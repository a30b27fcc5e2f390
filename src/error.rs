//! Error types for limiter construction, admission waits and persistence.

/// Errors surfaced by limiter construction and the waiting paths.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Invalid configuration, rejected at construction.
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// A wait or retry budget ran out before admission.
    #[error("{message}")]
    Exhausted {
        /// Key the admission was attempted against.
        key: String,
        /// Wait the limiter reported when the budget ran out, in milliseconds.
        wait_time_ms: u64,
        /// The budget that was exhausted, in milliseconds.
        max_wait_ms: u64,
        /// Human-readable summary.
        message: String,
    },

    /// A state read or write failed. Limiter calls log this and continue on
    /// the in-memory state; it only reaches callers through explicit
    /// persistence helpers.
    #[error("state persistence failed: {0}")]
    Persistence(String),
}

/// Error reported by a [`SharedCache`](crate::SharedCache) backend.
#[derive(Debug, thiserror::Error)]
#[error("cache backend error: {0}")]
pub struct CacheError(pub String);

/// Errors produced by the HTTP middleware, wrapping the caller's transport
/// error type.
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError<E> {
    /// Admission or retry budget exhausted.
    #[error(transparent)]
    RateLimit(RateLimitError),

    /// The caller's send function failed.
    #[error("request failed: {0}")]
    Transport(E),
}

impl<E> MiddlewareError<E> {
    /// The rate-limit error, if that is what this is.
    #[must_use]
    pub const fn as_rate_limit(&self) -> Option<&RateLimitError> {
        match self {
            Self::RateLimit(err) => Some(err),
            Self::Transport(_) => None,
        }
    }
}
