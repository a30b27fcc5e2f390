//! HTTP middleware: pre-admission, post-response reconciliation, and
//! 429-driven retry with exponential backoff.
//!
//! The middleware never issues requests itself; the caller hands it a send
//! function and gets the response back once the limiter and the server both
//! agree it may flow.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{MiddlewareError, RateLimitError};
use crate::headers::{flatten_headers, parse_retry_after};
use crate::RateLimiter;

const HTTP_TOO_MANY_REQUESTS: u16 = 429;

/// The view of an HTTP response the middleware needs: a status code and the
/// headers in multi-valued form.
pub trait PacedResponse {
    /// Numeric HTTP status.
    fn status_code(&self) -> u16;

    /// Response headers as `name -> [values]`. The middleware joins
    /// multi-valued entries with `", "` before reconciliation.
    fn header_values(&self) -> HashMap<String, Vec<String>>;
}

impl PacedResponse for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    fn header_values(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in self.headers() {
            if let Ok(value) = value.to_str() {
                map.entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        map
    }
}

/// Rate-limit-aware wrapper around one logical request key.
pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    key: String,
    max_retries: u32,
    backoff_multiplier: f64,
    max_wait: Duration,
    max_backoff: Duration,
}

impl RateLimitMiddleware {
    /// Wrap `limiter` for requests charged against `key`. Defaults: 3
    /// retries, doubling backoff, 10 s admission wait, 30 s backoff cap.
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter>, key: impl Into<String>) -> Self {
        Self {
            limiter,
            key: key.into(),
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_wait: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Set how many 429 responses are retried before giving up.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff growth factor.
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the admission wait budget per attempt.
    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the cap for a single backoff sleep.
    #[must_use]
    pub const fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Run one logical request: admit, send, reconcile, and retry on 429.
    ///
    /// # Errors
    /// [`MiddlewareError::RateLimit`] when the admission wait or the retry
    /// budget runs out, [`MiddlewareError::Transport`] when `send` fails.
    pub async fn execute<F, Fut, R, E>(&self, mut send: F) -> Result<R, MiddlewareError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: PacedResponse,
    {
        let mut attempt: u32 = 0;
        loop {
            if !self
                .limiter
                .wait_for_allowed(&self.key, 1, self.max_wait)
                .await
            {
                let wait_time_ms = duration_ms(self.limiter.wait_time(&self.key));
                let max_wait_ms = duration_ms(self.max_wait);
                return Err(MiddlewareError::RateLimit(RateLimitError::Exhausted {
                    key: self.key.clone(),
                    wait_time_ms,
                    max_wait_ms,
                    message: format!(
                        "no admission for key {} within {max_wait_ms} ms (next slot in {wait_time_ms} ms)",
                        self.key
                    ),
                }));
            }

            let response = send().await.map_err(MiddlewareError::Transport)?;
            let headers = flatten_headers(&response.header_values());
            self.limiter.update_from_headers(&self.key, &headers);

            if response.status_code() != HTTP_TOO_MANY_REQUESTS {
                debug!(key = %self.key, attempt, "request admitted and completed");
                return Ok(response);
            }

            attempt += 1;
            let retry_after_secs = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
                .map_or(1, |(_, value)| parse_retry_after(value));

            if attempt > self.max_retries {
                let wait_time_ms = retry_after_secs.saturating_mul(1_000);
                return Err(MiddlewareError::RateLimit(RateLimitError::Exhausted {
                    key: self.key.clone(),
                    wait_time_ms,
                    max_wait_ms: duration_ms(self.max_wait),
                    message: format!(
                        "server throttled key {} on {attempt} consecutive attempts (max_retries={}, Retry-After {retry_after_secs} s)",
                        self.key, self.max_retries
                    ),
                }));
            }

            let delay = ExponentialBackoff::new(
                Duration::from_secs(retry_after_secs),
                self.max_backoff,
            )
            .with_multiplier(self.backoff_multiplier)
            .delay(attempt);
            warn!(
                key = %self.key,
                attempt,
                delay_ms = duration_ms(delay),
                retry_after_secs,
                "throttled by server, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, LimiterConfig};

    /// Canned response for driving the loop without a socket.
    struct FakeResponse {
        status: u16,
        headers: HashMap<String, Vec<String>>,
    }

    impl FakeResponse {
        fn ok() -> Self {
            Self {
                status: 200,
                headers: HashMap::new(),
            }
        }

        fn throttled(retry_after: &str) -> Self {
            Self {
                status: 429,
                headers: HashMap::from([(
                    "retry-after".to_string(),
                    vec![retry_after.to_string()],
                )]),
            }
        }
    }

    impl PacedResponse for FakeResponse {
        fn status_code(&self) -> u16 {
            self.status
        }

        fn header_values(&self) -> HashMap<String, Vec<String>> {
            self.headers.clone()
        }
    }

    fn middleware(max_retries: u32) -> RateLimitMiddleware {
        let cfg = LimiterConfig::new(Algorithm::TokenBucket, 100.0, 100).with_safety_buffer(1.0);
        let limiter = crate::build_limiter(cfg, None).unwrap();
        RateLimitMiddleware::new(limiter, "api").with_max_retries(max_retries)
    }

    #[tokio::test]
    async fn passes_through_success() {
        let mw = middleware(3);
        let response = mw
            .execute(|| async { Ok::<_, std::io::Error>(FakeResponse::ok()) })
            .await
            .unwrap();
        assert_eq!(response.status_code(), 200);
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let mw = middleware(3);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = mw
            .execute(|| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    Err::<FakeResponse, _>(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "reset",
                    ))
                }
            })
            .await;
        assert!(matches!(result, Err(MiddlewareError::Transport(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_through_429_then_succeeds() {
        let mw = middleware(2);
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result = mw
            .execute(|| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok::<_, std::io::Error>(FakeResponse::throttled("2"))
                    } else {
                        Ok(FakeResponse::ok())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.status_code(), 200);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let mw = middleware(2);
        let result = mw
            .execute(|| async { Ok::<_, std::io::Error>(FakeResponse::throttled("1")) })
            .await;

        let Err(MiddlewareError::RateLimit(RateLimitError::Exhausted {
            key, message, ..
        })) = result
        else {
            panic!("expected exhaustion");
        };
        assert_eq!(key, "api");
        assert!(message.contains("max_retries=2"), "got {message}");
    }

    #[tokio::test]
    async fn reports_exhausted_wait_budget() {
        let cfg = LimiterConfig::new(Algorithm::TokenBucket, 0.5, 1).with_safety_buffer(1.0);
        let limiter = crate::build_limiter(cfg, None).unwrap();
        let mw = RateLimitMiddleware::new(limiter.clone(), "api")
            .with_max_wait(Duration::from_millis(20));

        // Drain the only token.
        assert!(limiter.is_allowed("api"));

        let result = mw
            .execute(|| async { Ok::<_, std::io::Error>(FakeResponse::ok()) })
            .await;

        let Err(MiddlewareError::RateLimit(RateLimitError::Exhausted {
            max_wait_ms,
            wait_time_ms,
            ..
        })) = result
        else {
            panic!("expected exhaustion");
        };
        assert_eq!(max_wait_ms, 20);
        assert!(wait_time_ms > 0);
    }
}
