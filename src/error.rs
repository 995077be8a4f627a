//! Error taxonomy for the publication pipeline
//!
//! Every failure that crosses a stage or service boundary is classified
//! into a kind that decides whether the queue worker retries the job or
//! fails the file entry. The kind is also persisted on the entry so a
//! failed file shows *why* it failed, not just that it did.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a pipeline failure.
///
/// The kind, not the concrete error, drives requeue-vs-fail decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused/reset, DNS failure, read timeout, 502/503/504
    NetworkTransient,
    /// HTTP 429; retry must honor Retry-After when supplied
    RateLimited,
    /// A circuit breaker is open for the dependency
    CircuitOpen,
    /// 401/403 with a non-transient signal
    AuthRejected,
    /// Schema/required-field/pattern violation, detected before any network call
    Validation,
    /// Duplicate check matched an existing release
    DuplicateRelease,
    /// 4xx other than 408/429 from an upstream service
    TrackerPermanent,
    /// Dependency down with no cached fallback
    ExternalUnavailable,
    /// Unreachable state or corrupted row
    InternalInvariant,
    /// Cancellation was requested
    Cancelled,
}

impl ErrorKind {
    /// Whether the worker should schedule another attempt for this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient
                | ErrorKind::RateLimited
                | ErrorKind::CircuitOpen
                | ErrorKind::ExternalUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::Validation => "validation",
            ErrorKind::DuplicateRelease => "duplicate_release",
            ErrorKind::TrackerPermanent => "tracker_permanent",
            ErrorKind::ExternalUnavailable => "external_unavailable",
            ErrorKind::InternalInvariant => "internal_invariant",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "network_transient" => ErrorKind::NetworkTransient,
            "rate_limited" => ErrorKind::RateLimited,
            "circuit_open" => ErrorKind::CircuitOpen,
            "auth_rejected" => ErrorKind::AuthRejected,
            "validation" => ErrorKind::Validation,
            "duplicate_release" => ErrorKind::DuplicateRelease,
            "tracker_permanent" => ErrorKind::TrackerPermanent,
            "external_unavailable" => ErrorKind::ExternalUnavailable,
            "internal_invariant" => ErrorKind::InternalInvariant,
            "cancelled" => ErrorKind::Cancelled,
            _ => return None,
        })
    }
}

/// A classified pipeline failure.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("rate limited by upstream: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("circuit open for {dependency}, retry in {retry_in:?}")]
    CircuitOpen {
        dependency: String,
        retry_in: Duration,
    },

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate release on {tracker}: {message}")]
    Duplicate { tracker: String, message: String },

    #[error("upstream rejected request (HTTP {status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("external service unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Network { .. } => ErrorKind::NetworkTransient,
            PipelineError::RateLimited { .. } => ErrorKind::RateLimited,
            PipelineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PipelineError::AuthRejected(_) => ErrorKind::AuthRejected,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Duplicate { .. } => ErrorKind::DuplicateRelease,
            PipelineError::Permanent { .. } => ErrorKind::TrackerPermanent,
            PipelineError::ExternalUnavailable(_) => ErrorKind::ExternalUnavailable,
            PipelineError::Invariant(_) => ErrorKind::InternalInvariant,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Upstream-suggested minimum delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::RateLimited { retry_after, .. } => *retry_after,
            PipelineError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Classify an HTTP status into the taxonomy.
    ///
    /// 408/429 and gateway errors are transient; other 4xx are terminal,
    /// with 401/403 surfaced as auth rejections.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => PipelineError::RateLimited {
                message,
                retry_after: None,
            },
            408 | 502 | 503 | 504 => PipelineError::Network {
                message: format!("HTTP {status}: {message}"),
            },
            401 | 403 => PipelineError::AuthRejected(message),
            s if (400..500).contains(&s) => PipelineError::Permanent { status, message },
            s => PipelineError::Network {
                message: format!("HTTP {s}: {message}"),
            },
        }
    }

    /// Classify a response, reading Retry-After on 429.
    pub fn from_response(status: u16, retry_after_secs: Option<u64>, message: String) -> Self {
        if status == 429 {
            return PipelineError::RateLimited {
                message,
                retry_after: retry_after_secs.map(Duration::from_secs),
            };
        }
        Self::from_status(status, message)
    }

    /// Transport-level errors (connect, timeout, decode) from reqwest.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            PipelineError::Network {
                message: err.to_string(),
            }
        } else if err.is_decode() || err.is_body() {
            PipelineError::Permanent {
                status: 0,
                message: format!("malformed response: {err}"),
            }
        } else {
            PipelineError::Network {
                message: err.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            PipelineError::from_status(503, "down").kind(),
            ErrorKind::NetworkTransient
        );
        assert_eq!(
            PipelineError::from_status(429, "slow down").kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            PipelineError::from_status(404, "missing").kind(),
            ErrorKind::TrackerPermanent
        );
        assert_eq!(
            PipelineError::from_status(401, "bad key").kind(),
            ErrorKind::AuthRejected
        );
        // 408 is a timeout, not a client error
        assert_eq!(
            PipelineError::from_status(408, "timeout").kind(),
            ErrorKind::NetworkTransient
        );
    }

    #[test]
    fn test_retryability() {
        assert!(ErrorKind::NetworkTransient.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::CircuitOpen.is_retryable());
        assert!(ErrorKind::ExternalUnavailable.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::TrackerPermanent.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_retry_after_propagation() {
        let err = PipelineError::from_response(429, Some(17), "limit".into());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ErrorKind::NetworkTransient,
            ErrorKind::RateLimited,
            ErrorKind::CircuitOpen,
            ErrorKind::AuthRejected,
            ErrorKind::Validation,
            ErrorKind::DuplicateRelease,
            ErrorKind::TrackerPermanent,
            ErrorKind::ExternalUnavailable,
            ErrorKind::InternalInvariant,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
    }
}
