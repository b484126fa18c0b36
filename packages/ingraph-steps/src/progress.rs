//! Per-job status bookkeeping shared by every step. `run` schedules work on
//! a background task and returns promptly (spec §4.4); `status` reads
//! whatever that task last wrote here. Grounded on the teacher's
//! `ReverseDependencyIndex`/`CheckpointManager` idiom of a `DashMap`-backed
//! table behind a small typed handle, rather than a bare `Mutex<HashMap>`.

use dashmap::DashMap;
use ingraph_pipeline::contract::StepStatus;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct JobHandle {
    status: Arc<Mutex<StepStatus>>,
    cancellation: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A table of in-flight (and completed) job runs for one step instance.
/// Every step owns exactly one of these.
#[derive(Default)]
pub struct JobTable {
    jobs: DashMap<Uuid, Arc<JobHandle>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self { jobs: DashMap::new() }
    }

    /// Registers a fresh run, overwriting any previous entry for this job id
    /// (a step re-run after resume starts clean).
    pub fn start(&self, job_id: Uuid) -> (Arc<Mutex<StepStatus>>, CancellationToken) {
        let status = Arc::new(Mutex::new(StepStatus::running(0, "starting")));
        let cancellation = CancellationToken::new();
        let handle = Arc::new(JobHandle {
            status: status.clone(),
            cancellation: cancellation.clone(),
            task: Mutex::new(None),
        });
        self.jobs.insert(job_id, handle);
        (status, cancellation)
    }

    /// Records the join handle for the background task so `cancel` can abort
    /// it if the cooperative cancellation path doesn't land in time.
    pub fn attach_task(&self, job_id: Uuid, task: tokio::task::JoinHandle<()>) {
        if let Some(handle) = self.jobs.get(&job_id) {
            *handle.task.lock() = Some(task);
        }
    }

    pub fn status(&self, job_id: Uuid) -> ingraph_pipeline::error::Result<StepStatus> {
        match self.jobs.get(&job_id) {
            Some(handle) => Ok(handle.status.lock().clone()),
            None => Ok(StepStatus::pending()),
        }
    }

    /// Best-effort graceful stop: flips the cancellation token and lets the
    /// running task observe it at its next suspension point.
    pub fn stop(&self, job_id: Uuid) {
        if let Some(handle) = self.jobs.get(&job_id) {
            handle.cancellation.cancel();
        }
    }

    /// Hard abort: aborts the background task outright, guaranteeing
    /// resource release even if the task never checked cancellation.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some(handle) = self.jobs.get(&job_id) {
            handle.cancellation.cancel();
            if let Some(task) = handle.task.lock().take() {
                task.abort();
            }
            *handle.status.lock() = StepStatus::cancelled();
        }
    }
}
