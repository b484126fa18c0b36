//! Job data model (spec §3 "Job", §4.3, §4.4 "StepDescriptor").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-step lifecycle state (spec §8 "Universal invariants": transitions
/// only along `pending -> running -> {completed, failed, cancelled,
/// skipped}`; no backward transitions except `running -> pending` on
/// crash-resume).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Cancelled | StepState::Skipped
        )
    }
}

/// Per-step progress and retry bookkeeping, owned by the orchestrator as
/// part of the job record (spec §3 Job.per-step state).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub state: StepState,
    pub percent: u8,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StepState::Pending,
            percent: 0,
            attempt: 0,
            last_error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Derived aggregate job state (spec §3 invariants: `failed` iff any step
/// `failed` after exhausting retries; `completed` iff all steps
/// `completed`; `cancelled` iff the cancellation flag was observed and no
/// step is still `running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAggregateState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Configuration-declared pipeline entry (spec §4.4, §6 config shape).
/// Loaded at startup; immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    pub concurrency: usize,
    pub retries: u32,
    pub backoff_seconds: u64,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// A job record: one invocation of the full pipeline over one repository
/// (spec §3). The step list snapshot is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub repository_path: String,
    pub options: serde_json::Value,
    pub steps: Vec<StepRecord>,
    pub cancellation_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Compare-and-swap version, incremented by the store on every update.
    pub version: u64,
}

impl Job {
    pub fn new(id: Uuid, repository_path: impl Into<String>, options: serde_json::Value, steps: &[StepDescriptor]) -> Self {
        let now = Utc::now();
        Self {
            id,
            repository_path: repository_path.into(),
            options,
            steps: steps.iter().map(|s| StepRecord::pending(&s.name)).collect(),
            cancellation_requested: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Derived aggregate state (spec §3 invariants).
    pub fn aggregate_state(&self) -> JobAggregateState {
        if self.cancellation_requested && !self.steps.iter().any(|s| s.state == StepState::Running) {
            return JobAggregateState::Cancelled;
        }
        if self.steps.iter().any(|s| s.state == StepState::Failed) {
            return JobAggregateState::Failed;
        }
        if self.steps.iter().all(|s| s.state == StepState::Completed || s.state == StepState::Skipped) {
            return JobAggregateState::Completed;
        }
        if self.steps.iter().any(|s| s.state == StepState::Running) {
            return JobAggregateState::Running;
        }
        JobAggregateState::Pending
    }
}

/// A progress event published to a job's channel (spec §4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: String,
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A query filter for `JobStore::list` (spec §4.3 `list(filter, page)`).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub repository_path: Option<String>,
    pub state: Option<JobAggregateState>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 50 }
    }
}

/// Immutable options map attached to a step descriptor, exposed as plain
/// JSON so step implementations parse only what they need.
pub type StepOptions = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors() -> Vec<StepDescriptor> {
        vec![
            StepDescriptor { name: "filesystem".into(), concurrency: 1, retries: 2, backoff_seconds: 1, options: serde_json::json!({}) },
            StepDescriptor { name: "ast".into(), concurrency: 1, retries: 2, backoff_seconds: 1, options: serde_json::json!({}) },
        ]
    }

    #[test]
    fn test_new_job_all_steps_pending() {
        let job = Job::new(Uuid::new_v4(), "/repo", serde_json::json!({}), &descriptors());
        assert_eq!(job.aggregate_state(), JobAggregateState::Pending);
        assert!(job.steps.iter().all(|s| s.state == StepState::Pending));
    }

    #[test]
    fn test_aggregate_completed_when_all_steps_completed() {
        let mut job = Job::new(Uuid::new_v4(), "/repo", serde_json::json!({}), &descriptors());
        for s in job.steps.iter_mut() {
            s.state = StepState::Completed;
        }
        assert_eq!(job.aggregate_state(), JobAggregateState::Completed);
    }

    #[test]
    fn test_aggregate_failed_if_any_step_failed() {
        let mut job = Job::new(Uuid::new_v4(), "/repo", serde_json::json!({}), &descriptors());
        job.steps[0].state = StepState::Completed;
        job.steps[1].state = StepState::Failed;
        assert_eq!(job.aggregate_state(), JobAggregateState::Failed);
    }

    #[test]
    fn test_aggregate_cancelled_only_when_no_step_running() {
        let mut job = Job::new(Uuid::new_v4(), "/repo", serde_json::json!({}), &descriptors());
        job.cancellation_requested = true;
        job.steps[0].state = StepState::Running;
        assert_eq!(job.aggregate_state(), JobAggregateState::Running);
        job.steps[0].state = StepState::Cancelled;
        assert_eq!(job.aggregate_state(), JobAggregateState::Cancelled);
    }

    #[test]
    fn test_skipped_steps_count_toward_completed() {
        let mut job = Job::new(Uuid::new_v4(), "/repo", serde_json::json!({}), &descriptors());
        job.steps[0].state = StepState::Completed;
        job.steps[1].state = StepState::Skipped;
        assert_eq!(job.aggregate_state(), JobAggregateState::Completed);
    }
}
