//! Pipeline Orchestrator (spec §4.5): runs a job's configured steps
//! strictly in order, polling each step's status until terminal, retrying
//! with exponential backoff, and handling cooperative cancellation.
//!
//! Grounded on the teacher's `orchestrator.rs` retry/backoff/heartbeat loop,
//! adapted from its parallel-DAG-of-stages scheduling to the sequential,
//! ordered-list model spec §4.5 actually calls for.

use crate::contract::{Step, StepOptions};
use crate::error::{ErrorKind, PipelineError, Result, StepError};
use crate::ordering::validate_order;
use crate::registry::StepRegistry;
use crate::worker::{StepQueue, Task};
use chrono::Utc;
use ingraph_jobs::{Job, JobStore, ProgressEvent, StepDescriptor, StepState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Resolved, validated configuration for one orchestrator run over a fixed
/// set of registered steps (spec §6 `steps:` list).
#[derive(Clone)]
pub struct PipelineConfig {
    pub descriptors: Vec<StepDescriptor>,
}

pub struct Orchestrator {
    registry: StepRegistry,
    job_store: Arc<dyn JobStore>,
    config: PipelineConfig,
    /// One Worker Runtime queue per step name (spec §4.6), spawned lazily on
    /// first dispatch and reused for the orchestrator's lifetime.
    queues: AsyncMutex<HashMap<String, StepQueue>>,
}

impl Orchestrator {
    /// Validates every step's dependencies against the configured order up
    /// front (spec §8 scenario 6), so a malformed pipeline never starts a
    /// job before failing loudly.
    pub fn new(
        registry: StepRegistry,
        job_store: Arc<dyn JobStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let names: Vec<String> = config.descriptors.iter().map(|d| d.name.clone()).collect();
        validate_order(&registry, &names)?;
        Ok(Self {
            registry,
            job_store,
            config,
            queues: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Returns the `StepQueue` for `descriptor.name`, spawning its worker
    /// pool the first time the step is dispatched (spec §4.6 "concurrency
    /// configured per step").
    async fn queue_for(&self, descriptor: &StepDescriptor, step: Arc<dyn Step>) -> StepQueue {
        let mut queues = self.queues.lock().await;
        queues
            .entry(descriptor.name.clone())
            .or_insert_with(|| StepQueue::spawn(step, self.job_store.clone(), descriptor.concurrency))
            .clone()
    }

    /// Creates the job record with every configured step `pending` (spec
    /// §4.5 step 1) and rejects a duplicate id (spec §4.5 edge cases).
    pub async fn submit(&self, job_id: Uuid, repository_path: impl Into<String>, options: StepOptions) -> Result<()> {
        let job = Job::new(job_id, repository_path.into(), options, &self.config.descriptors);
        self.job_store.create(job).await?;
        Ok(())
    }

    /// Runs a previously submitted job to completion, in-process. A real
    /// deployment drives this from the Worker Runtime's task queue; tests
    /// and the daemon's synchronous CLI path call it directly.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn run(&self, job_id: Uuid, cancellation: CancellationToken) -> Result<()> {
        let job = self.job_store.get(job_id).await?;
        let repo_path = PathBuf::from(job.repository_path.clone());

        // Crash-resume (spec §4.5 edge cases): a step left `running` from a
        // prior process lifetime is reset to `pending` so it restarts.
        self.job_store
            .update(
                job_id,
                Box::new(|job| {
                    for step in job.steps.iter_mut() {
                        if step.state == StepState::Running {
                            step.state = StepState::Pending;
                            step.percent = 0;
                        }
                    }
                    Ok(())
                }),
            )
            .await?;

        for descriptor in &self.config.descriptors {
            if cancellation.is_cancelled() || self.job_store.get(job_id).await?.cancellation_requested {
                self.cancel_current(job_id, &descriptor.name, &cancellation).await?;
                return Err(PipelineError::Cancelled);
            }

            let step = self.registry.get(&descriptor.name)?;
            let current = self.job_store.get(job_id).await?;
            if current
                .step(&descriptor.name)
                .map(|s| s.state == StepState::Completed || s.state == StepState::Skipped)
                .unwrap_or(false)
            {
                continue; // resumed run: this step already finished before the crash.
            }

            self.run_step_with_retry(
                job_id,
                step,
                descriptor,
                repo_path.clone(),
                &cancellation,
            )
            .await?;
        }

        info!("job completed");
        Ok(())
    }

    async fn run_step_with_retry(
        &self,
        job_id: Uuid,
        step: Arc<dyn Step>,
        descriptor: &StepDescriptor,
        repo_path: PathBuf,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let max_attempts = descriptor.retries.max(1);
        let mut attempt = 1;

        loop {
            self.job_store
                .update(
                    job_id,
                    {
                        let name = descriptor.name.clone();
                        Box::new(move |job| {
                            if let Some(record) = job.step_mut(&name) {
                                record.state = StepState::Running;
                                record.attempt = attempt;
                                record.started_at = Some(Utc::now());
                            }
                            Ok(())
                        })
                    },
                )
                .await?;

            let queue = self.queue_for(descriptor, step.clone()).await;
            queue
                .submit(Task {
                    job_id,
                    repo_path: repo_path.clone(),
                    options: descriptor.options.clone(),
                })
                .await?;

            let outcome = self
                .poll_until_terminal(job_id, step.as_ref(), &descriptor.name, cancellation)
                .await?;

            match outcome {
                StepState::Completed | StepState::Skipped => {
                    self.mark_step_terminal(job_id, &descriptor.name, outcome, None).await?;
                    return Ok(());
                }
                StepState::Cancelled => {
                    self.mark_step_terminal(job_id, &descriptor.name, outcome, None).await?;
                    return Err(PipelineError::Cancelled);
                }
                StepState::Failed => {
                    if attempt < max_attempts {
                        let delay = Duration::from_secs(
                            descriptor.backoff_seconds.saturating_mul(1u64 << (attempt - 1)),
                        );
                        warn!(step = %descriptor.name, attempt, delay_secs = delay.as_secs(), "step failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let error = StepError::new(ErrorKind::ToolFailure, "step exhausted retries");
                    self.mark_step_terminal(job_id, &descriptor.name, StepState::Failed, Some(error.clone()))
                        .await?;
                    return Err(PipelineError::StepFailed {
                        step: descriptor.name.clone(),
                        error,
                    });
                }
                StepState::Pending | StepState::Running => {
                    unreachable!("poll_until_terminal only returns terminal states")
                }
            }
        }
    }

    /// Polls `status` at least every second (spec §4.5 step 2b), forwarding
    /// percent to the job's progress channel, until a terminal state or a
    /// cancellation request is observed.
    async fn poll_until_terminal(
        &self,
        job_id: Uuid,
        step: &dyn Step,
        step_name: &str,
        cancellation: &CancellationToken,
    ) -> Result<StepState> {
        loop {
            if cancellation.is_cancelled() || self.job_store.get(job_id).await?.cancellation_requested {
                self.cancel_current(job_id, step_name, cancellation).await?;
                return Ok(StepState::Cancelled);
            }

            let status = step.status(job_id).await?;
            self.job_store
                .publish(
                    job_id,
                    ProgressEvent {
                        step: step_name.to_string(),
                        percent: status.percent,
                        message: status.message.clone().unwrap_or_default(),
                        timestamp: Utc::now(),
                    },
                )
                .await?;

            if status.state.is_terminal() {
                return Ok(status.state);
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Cooperative cancellation (spec §4.5 step 2f): ask the step to stop,
    /// escalate to a hard cancel if it is still running after the grace
    /// period.
    async fn cancel_current(&self, job_id: Uuid, step_name: &str, _cancellation: &CancellationToken) -> Result<()> {
        let step = self.registry.get(step_name)?;
        step.stop(job_id).await?;

        let deadline = tokio::time::Instant::now() + CANCEL_GRACE_PERIOD;
        while tokio::time::Instant::now() < deadline {
            let status = step.status(job_id).await?;
            if status.state.is_terminal() {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        step.cancel(job_id).await
    }

    async fn mark_step_terminal(
        &self,
        job_id: Uuid,
        step_name: &str,
        state: StepState,
        error: Option<StepError>,
    ) -> Result<()> {
        let name = step_name.to_string();
        self.job_store
            .update(
                job_id,
                Box::new(move |job| {
                    if let Some(record) = job.step_mut(&name) {
                        record.state = state;
                        record.ended_at = Some(Utc::now());
                        record.percent = if state == StepState::Completed { 100 } else { record.percent };
                        record.last_error = error.as_ref().map(|e| e.to_string());
                    }
                    Ok(())
                }),
            )
            .await?;
        if state == StepState::Cancelled {
            self.job_store
                .update(job_id, Box::new(|job| { job.cancellation_requested = true; Ok(()) }))
                .await?;
        }
        Ok(())
    }

    pub fn subscribe(&self, job_id: Uuid) -> impl std::future::Future<Output = Result<broadcast::Receiver<ProgressEvent>>> + '_ {
        self.job_store.subscribe(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{StepOptions as Opts, StepStatus};
    use async_trait::async_trait;
    use ingraph_jobs::InMemoryJobStore;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct ScriptedStep {
        name: &'static str,
        deps: Vec<String>,
        // Sequence of statuses returned on successive `status` polls, per job.
        script: Mutex<HashMap<Uuid, Vec<StepStatus>>>,
        run_count: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedStep {
        fn new(name: &'static str, deps: Vec<String>) -> Self {
            Self {
                name,
                deps,
                script: Mutex::new(HashMap::new()),
                run_count: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn seed(&self, job_id: Uuid, statuses: Vec<StepStatus>) {
            self.script.lock().insert(job_id, statuses);
        }
    }

    #[async_trait]
    impl Step for ScriptedStep {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn run(&self, _job_id: Uuid, _repo_path: PathBuf, _options: Opts) -> Result<()> {
            self.run_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self, job_id: Uuid) -> Result<StepStatus> {
            let mut script = self.script.lock();
            let remaining = script.get_mut(&job_id).expect("status queried before seeding");
            if remaining.len() > 1 {
                Ok(remaining.remove(0))
            } else {
                Ok(remaining[0].clone())
            }
        }

        async fn stop(&self, _job_id: Uuid) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self, _job_id: Uuid) -> Result<()> {
            Ok(())
        }
    }

    fn descriptor(name: &str, retries: u32) -> StepDescriptor {
        StepDescriptor {
            name: name.to_string(),
            concurrency: 1,
            retries,
            backoff_seconds: 0,
            options: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_single_step_job_completes() {
        let step = Arc::new(ScriptedStep::new("filesystem", vec![]));
        let mut registry = StepRegistry::new();
        registry.register(step.clone());

        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let config = PipelineConfig { descriptors: vec![descriptor("filesystem", 1)] };
        let orchestrator = Orchestrator::new(registry, job_store.clone(), config).unwrap();

        let job_id = Uuid::new_v4();
        orchestrator.submit(job_id, "/repo", serde_json::json!({})).await.unwrap();
        step.seed(job_id, vec![StepStatus::completed()]);

        orchestrator.run(job_id, CancellationToken::new()).await.unwrap();

        let job = job_store.get(job_id).await.unwrap();
        assert_eq!(job.aggregate_state(), ingraph_jobs::JobAggregateState::Completed);
        assert_eq!(step.run_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_is_dispatched_through_the_worker_queue() {
        let step = Arc::new(ScriptedStep::new("filesystem", vec![]));
        let mut registry = StepRegistry::new();
        registry.register(step.clone());

        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let config = PipelineConfig { descriptors: vec![descriptor("filesystem", 1)] };
        let orchestrator = Orchestrator::new(registry, job_store.clone(), config).unwrap();

        let job_id = Uuid::new_v4();
        orchestrator.submit(job_id, "/repo", serde_json::json!({})).await.unwrap();
        step.seed(job_id, vec![StepStatus::completed()]);

        orchestrator.run(job_id, CancellationToken::new()).await.unwrap();

        // `run` only ever executes inside a `StepQueue` worker, never called
        // synchronously by the orchestrator itself.
        assert_eq!(step.run_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(orchestrator.queues.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fails_job() {
        let step = Arc::new(ScriptedStep::new("filesystem", vec![]));
        let mut registry = StepRegistry::new();
        registry.register(step.clone());

        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let config = PipelineConfig { descriptors: vec![descriptor("filesystem", 1)] };
        let orchestrator = Orchestrator::new(registry, job_store.clone(), config).unwrap();

        let job_id = Uuid::new_v4();
        orchestrator.submit(job_id, "/repo", serde_json::json!({})).await.unwrap();
        step.seed(job_id, vec![StepStatus::failed(StepError::new(ErrorKind::ToolFailure, "boom"))]);

        let result = orchestrator.run(job_id, CancellationToken::new()).await;
        assert!(matches!(result, Err(PipelineError::StepFailed { .. })));

        let job = job_store.get(job_id).await.unwrap();
        assert_eq!(job.aggregate_state(), ingraph_jobs::JobAggregateState::Failed);
    }

    #[tokio::test]
    async fn test_reversed_dependency_rejected_at_construction() {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(ScriptedStep::new("ast", vec!["filesystem".to_string()])));
        registry.register(Arc::new(ScriptedStep::new("filesystem", vec![])));

        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let config = PipelineConfig { descriptors: vec![descriptor("ast", 1), descriptor("filesystem", 1)] };
        let result = Orchestrator::new(registry, job_store, config);
        assert!(matches!(result, Err(PipelineError::UnsatisfiedDependency { .. })));
    }
}
