//! Error taxonomy for the orchestrator (spec §7). Each crate in this
//! workspace follows the same `thiserror` enum + `kind`/`retryable`
//! discriminant idiom so the orchestrator's retry policy never matches on
//! concrete error types — only on `StepError::retryable`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error kinds named in spec §7 (not concrete Rust types — this enum *is*
/// the discriminant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed pipeline config, unknown step name. Fatal at startup.
    Configuration,
    /// Graph connection refused, broker timeout, LLM rate limit.
    TransientInfrastructure,
    /// Invalid repo path, unreadable file.
    PermanentInput,
    /// External parser non-zero exit.
    ToolFailure,
    /// Per-node LLM failure in the Summarizer; peers continue.
    PartialData,
    /// User requested cancellation.
    Cancelled,
    /// Per-operation timeout, treated as transient for retry purposes.
    Timeout,
}

impl ErrorKind {
    /// Whether the orchestrator's retry policy applies to a step-level
    /// failure of this kind (spec §7 propagation policy).
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientInfrastructure | ErrorKind::Timeout
        )
    }
}

/// The structured payload a step converts any internal error into (spec
/// §4.4, §7: `{kind, message, retryable, context}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = kind.default_retryable();
        Self {
            kind,
            message: message.into(),
            retryable,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

/// Orchestrator-level failures: configuration problems caught at startup,
/// and the orchestrator's own bookkeeping errors (job-store, registry).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown step in configuration: {0}")]
    UnknownStep(String),

    #[error("step {step} depends on {dependency}, which is not satisfied earlier in the configured order")]
    UnsatisfiedDependency { step: String, dependency: String },

    #[error("job store error: {0}")]
    JobStore(#[from] ingraph_jobs::JobsError),

    #[error("step {step} failed: {error}")]
    StepFailed { step: String, error: StepError },

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
