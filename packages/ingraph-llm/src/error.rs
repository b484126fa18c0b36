//! Error types for the LLM Gateway and the providers behind it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors surfaced by a provider or the gateway wrapping it.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    #[error("model not found or unavailable: {0}")]
    ModelNotFound(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        /// Server-advised delay from a `Retry-After` header, when present.
        retry_after: Option<std::time::Duration>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl LlmError {
    /// Transient failures the gateway's own retry loop will retry
    /// internally; the step above never sees them unless the budget is
    /// exhausted (spec §5 "LLM Gateway ... its internal retry is the only
    /// retry against that service").
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::HttpError(_)
                | LlmError::ServiceUnavailable(_)
                | LlmError::Timeout(_)
                | LlmError::RateLimitExceeded { .. }
        )
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::SerializationError(err.to_string())
    }
}
