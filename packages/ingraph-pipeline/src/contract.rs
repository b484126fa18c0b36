//! The Step contract (spec §4.4): every pipeline stage — filesystem, ast,
//! summarizer, documentation — implements this trait. The orchestrator and
//! worker runtime depend only on it, never on a concrete step type.

use crate::error::{Result, StepError};
use async_trait::async_trait;
use ingraph_jobs::StepState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Live status of a step's execution for one job (spec §4.4 `status`,
/// distinct from the `StepRecord` the Job State Store persists — a step
/// reports this on demand; the worker copies it into the job record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    pub state: StepState,
    pub percent: u8,
    pub message: Option<String>,
    pub error: Option<StepError>,
}

impl StepStatus {
    pub fn pending() -> Self {
        Self {
            state: StepState::Pending,
            percent: 0,
            message: None,
            error: None,
        }
    }

    pub fn running(percent: u8, message: impl Into<String>) -> Self {
        Self {
            state: StepState::Running,
            percent,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn completed() -> Self {
        Self {
            state: StepState::Completed,
            percent: 100,
            message: None,
            error: None,
        }
    }

    pub fn failed(error: StepError) -> Self {
        Self {
            state: StepState::Failed,
            percent: 0,
            message: Some(error.message.clone()),
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: StepState::Cancelled,
            percent: 0,
            message: None,
            error: None,
        }
    }
}

/// Opaque, step-specific configuration, passed through unread by the
/// orchestrator (spec §6 `options` map).
pub type StepOptions = serde_json::Value;

/// Every pipeline stage implements this (spec §4.4). `run` is expected to
/// return promptly after scheduling work on the Worker Runtime — the
/// orchestrator polls `status` to observe progress.
#[async_trait]
pub trait Step: Send + Sync {
    /// The identifier matched against configuration (spec §4.4 `name()`).
    fn name(&self) -> &str;

    /// Step names that must complete earlier in the same job's configured
    /// order (spec §4.4 `dependencies()`).
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Begins work; returns once scheduled, not once finished.
    async fn run(&self, job_id: Uuid, repo_path: PathBuf, options: StepOptions) -> Result<()>;

    async fn status(&self, job_id: Uuid) -> Result<StepStatus>;

    /// Best-effort graceful termination.
    async fn stop(&self, job_id: Uuid) -> Result<()>;

    /// Hard abort; guarantees resource release.
    async fn cancel(&self, job_id: Uuid) -> Result<()>;

    /// Incremental re-run over changed inputs only (spec §4.4
    /// `ingestion_update`). Steps that have no meaningful incremental mode
    /// may delegate to `run`.
    async fn ingestion_update(
        &self,
        job_id: Uuid,
        repo_path: PathBuf,
        options: StepOptions,
    ) -> Result<()> {
        self.run(job_id, repo_path, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_step_status_failed_carries_message_from_error() {
        let err = StepError::new(ErrorKind::ToolFailure, "parser exited 1");
        let status = StepStatus::failed(err);
        assert_eq!(status.state, StepState::Failed);
        assert_eq!(status.message.as_deref(), Some("parser exited 1"));
    }

    #[test]
    fn test_step_status_completed_is_full_percent() {
        let status = StepStatus::completed();
        assert_eq!(status.percent, 100);
        assert_eq!(status.state, StepState::Completed);
    }
}
