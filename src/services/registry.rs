//! Shared service registry
//!
//! Rate-limiter buckets and circuit breakers are process-wide by intent:
//! every caller hitting the same dependency must share pacing and breaker
//! state. Rather than hidden globals, the registry is built once at the
//! root and passed down explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::rate_limiter::{RateLimitConfig, RateLimiter};

pub struct ServiceRegistry {
    rate_limiter: RateLimiter,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            rate_limiter: RateLimiter::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Apply configured overrides, keyed `"service/action"`.
    pub async fn with_rate_limits(self, overrides: &HashMap<String, RateLimitConfig>) -> Self {
        for (key, config) in overrides {
            let (service, action) = key.split_once('/').unwrap_or((key.as_str(), "*"));
            self.rate_limiter.configure(service, action, *config).await;
        }
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Get or create the breaker for a named dependency.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breaker_with(name, CircuitBreakerConfig::default())
    }

    pub fn breaker_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Observable breaker states for health reporting.
    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        let breakers = self.breakers.lock().expect("registry lock poisoned");
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_is_shared_by_name() {
        let registry = ServiceRegistry::new();
        let a = registry.breaker("flaresolverr");
        let b = registry.breaker("flaresolverr");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_rate_limit_override_key_parsing() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "tracker/demo/upload".to_string(),
            RateLimitConfig {
                capacity: 2,
                refill_rate: 0.5,
            },
        );
        let registry = ServiceRegistry::new().with_rate_limits(&overrides).await;
        let status = registry
            .rate_limiter()
            .status("tracker/demo", "upload")
            .await;
        assert_eq!(status.capacity, 2);
    }
}
