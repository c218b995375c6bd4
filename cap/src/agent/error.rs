//! Agent client error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during agent calls
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Empty response from model")]
    EmptyResponse,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Check if this is a rate limit error
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AgentError::RateLimited { .. })
    }

    /// Transient errors worth the infrastructure retry loop
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::RateLimited { .. } => true,
            AgentError::Api { status, .. } => *status == 429 || *status >= 500,
            AgentError::Network(_) => true,
            AgentError::Timeout(_) => true,
            AgentError::EmptyResponse => true,
            AgentError::InvalidResponse(_) => false,
            AgentError::Json(_) => false,
        }
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AgentError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(
            AgentError::RateLimited {
                retry_after: Duration::from_secs(30)
            }
            .is_retryable()
        );
        assert!(
            AgentError::Api {
                status: 503,
                message: "unavailable".to_string()
            }
            .is_retryable()
        );
        assert!(
            AgentError::Api {
                status: 429,
                message: "slow down".to_string()
            }
            .is_retryable()
        );
        assert!(
            !AgentError::Api {
                status: 400,
                message: "bad request".to_string()
            }
            .is_retryable()
        );
        assert!(AgentError::EmptyResponse.is_retryable());
        assert!(!AgentError::InvalidResponse("garbage".to_string()).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = AgentError::RateLimited {
            retry_after: Duration::from_secs(7),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(AgentError::EmptyResponse.retry_after(), None);
    }
}
