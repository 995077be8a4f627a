//! Circuit breaker for unreliable dependencies
//!
//! Protects callers from hammering a dependency that is already down,
//! notably the Cloudflare-bypass service. After a run of failures the
//! breaker fails fast; after a cooldown a single probe is admitted to
//! test recovery.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls fail fast until the cooldown elapses
    Open,
    /// One probe call is in flight to test recovery
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within `window` that open the circuit
    pub failure_threshold: u32,
    /// Window in which failures accumulate
    pub window: Duration,
    /// How long the circuit stays open before admitting a probe
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// A named circuit breaker.
///
/// State changes are serialized behind a mutex; the guarded operation
/// itself runs outside the lock.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                window_start: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, transitioning Open -> HalfOpen when the cooldown
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if now.duration_since(opened_at) >= self.config.open_duration {
                    info!(breaker = %self.name, "Circuit transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = false;
                }
            }
        }
    }

    /// Admission check. Returns the fast-fail error while open, and
    /// reserves the single probe slot while half-open.
    fn before_call(&self) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_in = inner
                    .opened_at
                    .map(|t| {
                        self.config
                            .open_duration
                            .saturating_sub(now.duration_since(t))
                    })
                    .unwrap_or(self.config.open_duration);
                Err(PipelineError::CircuitOpen {
                    dependency: self.name.clone(),
                    retry_in,
                })
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(PipelineError::CircuitOpen {
                        dependency: self.name.clone(),
                        retry_in: self.config.open_duration,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closing after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();

        if inner.state == CircuitState::HalfOpen {
            warn!(breaker = %self.name, "Probe failed, reopening circuit");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.probe_in_flight = false;
            return;
        }

        // Failures outside the window start a fresh count
        match inner.window_start {
            Some(start) if now.duration_since(start) <= self.config.window => {
                inner.failures += 1;
            }
            _ => {
                inner.failures = 1;
                inner.window_start = Some(now);
            }
        }

        warn!(
            breaker = %self.name,
            failures = inner.failures,
            threshold = self.config.failure_threshold,
            "Dependency failure recorded"
        );

        if inner.failures >= self.config.failure_threshold {
            warn!(breaker = %self.name, "Circuit opened");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }

    /// Run `operation` under the breaker.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        self.before_call()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                // Cancellation is not a dependency failure
                if !matches!(e, PipelineError::Cancelled) {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            open_duration: Duration::from_millis(50),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), PipelineError> {
        breaker
            .call(|| async {
                Err::<(), _>(PipelineError::Network {
                    message: "refused".into(),
                })
            })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("flaresolverr", fast_config());

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fast fail without invoking the operation
        let mut invoked = false;
        let result = breaker
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe_then_closes() {
        let breaker = CircuitBreaker::new("flaresolverr", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("flaresolverr", fast_config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new("flaresolverr", fast_config());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = breaker.call(|| async { Ok(()) }).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        // Two failures after a success: still closed
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
