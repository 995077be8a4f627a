//! FlareSolverr client for Cloudflare-protected trackers
//!
//! Delegates challenge solving to a FlareSolverr instance and hands back
//! the cookies and user agent the tracker adapter needs. The service is
//! flaky by nature, so every call goes through the shared circuit
//! breaker: three failures inside a minute open the circuit and callers
//! fail fast until a probe succeeds.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::services::circuit_breaker::CircuitState;
use crate::services::registry::ServiceRegistry;

/// A solved Cloudflare session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudflareSession {
    pub cookies: Vec<SessionCookie>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
}

impl CloudflareSession {
    /// Render the cookies as a single `Cookie` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: Option<String>,
    message: Option<String>,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    #[serde(default)]
    cookies: Vec<SolverCookie>,
    #[serde(rename = "userAgent")]
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SolverCookie {
    name: String,
    value: String,
    domain: Option<String>,
}

pub struct FlareSolverrClient {
    client: reqwest::Client,
    base_url: String,
    max_timeout_ms: u64,
    registry: Arc<ServiceRegistry>,
}

impl FlareSolverrClient {
    pub fn new(base_url: String, max_timeout_ms: u64, registry: Arc<ServiceRegistry>) -> Self {
        let timeout = Duration::from_millis(max_timeout_ms) + Duration::from_secs(10);
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_timeout_ms,
            registry,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.registry.breaker("flaresolverr").state()
    }

    /// Solve the Cloudflare challenge for a URL and return the session.
    pub async fn get_session(&self, url: &str) -> Result<CloudflareSession, PipelineError> {
        let breaker = self.registry.breaker("flaresolverr");
        breaker
            .call(|| async {
                self.registry
                    .rate_limiter()
                    .acquire("flaresolverr", "solve")
                    .await;
                debug!(url = url, "Requesting Cloudflare bypass");

                let response = self
                    .client
                    .post(format!("{}/v1", self.base_url))
                    .json(&json!({
                        "cmd": "request.get",
                        "url": url,
                        "maxTimeout": self.max_timeout_ms,
                    }))
                    .send()
                    .await
                    .map_err(PipelineError::from_reqwest)?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(PipelineError::ExternalUnavailable(format!(
                        "FlareSolverr returned HTTP {}: {}",
                        status.as_u16(),
                        body.chars().take(200).collect::<String>()
                    )));
                }

                let parsed: SolverResponse = response
                    .json()
                    .await
                    .map_err(PipelineError::from_reqwest)?;

                if parsed.status.as_deref() != Some("ok") {
                    return Err(PipelineError::ExternalUnavailable(format!(
                        "FlareSolverr failed to solve challenge: {}",
                        parsed.message.unwrap_or_else(|| "no message".into())
                    )));
                }

                let solution = parsed.solution.ok_or_else(|| {
                    PipelineError::ExternalUnavailable(
                        "FlareSolverr response missing solution".into(),
                    )
                })?;

                let session = CloudflareSession {
                    cookies: solution
                        .cookies
                        .into_iter()
                        .map(|c| SessionCookie {
                            name: c.name,
                            value: c.value,
                            domain: c.domain,
                        })
                        .collect(),
                    user_agent: solution.user_agent,
                };

                info!(
                    url = url,
                    cookies = session.cookies.len(),
                    "Cloudflare session established"
                );
                Ok(session)
            })
            .await
    }

    /// Liveness probe, outside the breaker so health checks observe the
    /// real service state.
    pub async fn health_check(&self) -> bool {
        self.client
            .get(&self.base_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_header_rendering() {
        let session = CloudflareSession {
            cookies: vec![
                SessionCookie {
                    name: "cf_clearance".into(),
                    value: "abc123".into(),
                    domain: Some(".tracker.example".into()),
                },
                SessionCookie {
                    name: "session".into(),
                    value: "xyz".into(),
                    domain: None,
                },
            ],
            user_agent: Some("Mozilla/5.0".into()),
        };
        assert_eq!(session.cookie_header(), "cf_clearance=abc123; session=xyz");
    }
}
