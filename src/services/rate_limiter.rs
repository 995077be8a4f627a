//! Rate limiting and retry logic for external API calls
//!
//! Provides per-service token buckets and a retry wrapper to avoid
//! overwhelming external APIs and to ride out transient failures.
//! Buckets are keyed by `(service, action)` so a tracker's upload and
//! search endpoints can be paced independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// Configuration for one token bucket.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket can hold (burst allowance)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_rate: 1.0,
        }
    }
}

/// Token bucket with continuous refill.
///
/// `tokens` never exceeds `capacity`; an acquire on an empty bucket waits
/// at least `n / refill_rate` seconds.
#[derive(Debug)]
struct TokenBucket {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            tokens: config.capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.config.refill_rate).min(self.config.capacity as f64);
        self.last_refill = now;
    }

    /// Take `n` tokens if available, otherwise report how long to wait.
    fn try_acquire(&mut self, n: u32, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        let needed = n as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            Ok(())
        } else {
            let deficit = needed - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.config.refill_rate))
        }
    }
}

/// Snapshot of a bucket for status endpoints and tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BucketStatus {
    pub key: String,
    pub available_tokens: f64,
    pub capacity: u32,
    pub refill_rate: f64,
}

/// Multi-service rate limiter keyed by `(service, action)`.
///
/// Buckets are created lazily; `configure` installs per-key overrides
/// (e.g. from a tracker schema's `rate_limiting` section).
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    overrides: Mutex<HashMap<String, RateLimitConfig>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    fn key(service: &str, action: &str) -> String {
        format!("{service}/{action}")
    }

    /// Built-in pacing for known services.
    fn default_config(service: &str, action: &str) -> RateLimitConfig {
        match (service, action) {
            ("tmdb", _) => RateLimitConfig {
                capacity: 4,
                refill_rate: 4.0,
            },
            (s, "upload") if s.starts_with("tracker/") => RateLimitConfig {
                capacity: 1,
                refill_rate: 1.0,
            },
            (s, "search") if s.starts_with("tracker/") => RateLimitConfig {
                capacity: 2,
                refill_rate: 2.0,
            },
            ("image", "upload") => RateLimitConfig {
                capacity: 1,
                refill_rate: 1.0,
            },
            // FlareSolverr solves challenges slowly; keep it gentle
            ("flaresolverr", _) => RateLimitConfig {
                capacity: 2,
                refill_rate: 0.5,
            },
            ("qbittorrent", _) => RateLimitConfig {
                capacity: 10,
                refill_rate: 5.0,
            },
            ("prowlarr", _) => RateLimitConfig {
                capacity: 5,
                refill_rate: 2.0,
            },
            _ => RateLimitConfig::default(),
        }
    }

    /// Install an override for a key, resetting any existing bucket.
    pub async fn configure(&self, service: &str, action: &str, config: RateLimitConfig) {
        let key = Self::key(service, action);
        self.overrides.lock().await.insert(key.clone(), config);
        self.buckets.lock().await.remove(&key);
        debug!(
            key = %key,
            refill_rate = config.refill_rate,
            capacity = config.capacity,
            "Rate limit configured"
        );
    }

    async fn bucket(&self, service: &str, action: &str) -> Arc<Mutex<TokenBucket>> {
        let key = Self::key(service, action);
        let mut buckets = self.buckets.lock().await;
        if let Some(bucket) = buckets.get(&key) {
            return bucket.clone();
        }
        let config = self
            .overrides
            .lock()
            .await
            .get(&key)
            .copied()
            .unwrap_or_else(|| Self::default_config(service, action));
        let bucket = Arc::new(Mutex::new(TokenBucket::new(config)));
        buckets.insert(key, bucket.clone());
        bucket
    }

    /// Acquire one token, suspending until it is available.
    pub async fn acquire(&self, service: &str, action: &str) {
        self.acquire_n(service, action, 1).await;
    }

    /// Acquire `n` tokens, suspending until they are available.
    pub async fn acquire_n(&self, service: &str, action: &str, n: u32) {
        let bucket = self.bucket(service, action).await;
        loop {
            let wait = {
                let mut guard = bucket.lock().await;
                match guard.try_acquire(n, Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };
            debug!(
                service = service,
                action = action,
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting for tokens"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Snapshot of one bucket (creating it with defaults if absent).
    pub async fn status(&self, service: &str, action: &str) -> BucketStatus {
        let bucket = self.bucket(service, action).await;
        let mut guard = bucket.lock().await;
        guard.refill(Instant::now());
        BucketStatus {
            key: Self::key(service, action),
            available_tokens: guard.tokens,
            capacity: guard.config.capacity,
            refill_rate: guard.config.refill_rate,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry configuration for the wrapper below.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Cap on a single backoff delay
    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Deterministic doubling schedule: 1s, 2s, 4s, ... capped at max_interval.
    fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Execute an operation with retry on retryable classifications.
///
/// Terminal errors (validation, auth, permanent 4xx) propagate on the
/// first failure with their classification intact. A 429's Retry-After
/// extends the computed backoff, never shortens it. Cancellation is
/// honored between attempts and during backoff sleeps.
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> std::result::Result<T, PipelineError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, PipelineError>>,
{
    let mut backoff = config.to_backoff();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                warn!(
                    operation = operation_name,
                    error = %e,
                    "Operation failed with terminal error, not retrying"
                );
                return Err(e);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max attempts"
                    );
                    return Err(e);
                }

                let mut delay = backoff
                    .next_backoff()
                    .unwrap_or(config.max_interval)
                    .min(config.max_interval);
                if let Some(hint) = e.retry_after() {
                    delay = delay.max(hint.min(config.max_interval));
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_bucket_never_exceeds_capacity() {
        let limiter = RateLimiter::new();
        limiter
            .configure(
                "test",
                "op",
                RateLimitConfig {
                    capacity: 3,
                    refill_rate: 1000.0,
                },
            )
            .await;

        // Even after ample refill time, tokens stay at capacity
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = limiter.status("test", "op").await;
        assert!(status.available_tokens <= 3.0);
    }

    #[tokio::test]
    async fn test_empty_bucket_waits_at_least_refill_interval() {
        let limiter = RateLimiter::new();
        limiter
            .configure(
                "test",
                "op",
                RateLimitConfig {
                    capacity: 1,
                    refill_rate: 10.0,
                },
            )
            .await;

        limiter.acquire("test", "op").await;
        let start = Instant::now();
        limiter.acquire("test", "op").await;
        // 1 token at 10/s refill: at least 100ms
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_burst_proceeds_without_wait() {
        let limiter = RateLimiter::new();
        limiter
            .configure(
                "test",
                "op",
                RateLimitConfig {
                    capacity: 4,
                    refill_rate: 4.0,
                },
            )
            .await;

        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire("test", "op").await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        };
        let cancel = CancellationToken::new();

        let result: std::result::Result<(), _> =
            retry_with_backoff("test_op", &config, &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(PipelineError::Network {
                        message: "refused".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_terminal_error() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();

        let result: std::result::Result<(), _> =
            retry_with_backoff("test_op", &config, &cancel, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PipelineError::Validation("missing field".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 5,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
        };
        let cancel = CancellationToken::new();

        let result = retry_with_backoff("test_op", &config, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::Network {
                        message: "reset".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transparent_to_cancellation() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: std::result::Result<(), _> =
            retry_with_backoff("test_op", &config, &cancel, || async {
                Err(PipelineError::Network {
                    message: "refused".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
