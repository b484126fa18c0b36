//! The `JobStore` port (spec §4.3): durable per-job records plus a
//! best-effort progress pub/sub channel.

use crate::error::Result;
use crate::model::{Job, JobFilter, Page, ProgressEvent};
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A transition applied to a job under compare-and-swap. Returning `Err`
/// aborts the update without retrying (the store only retries on a version
/// conflict, not on the transition's own business-logic errors).
pub type Transition = Box<dyn FnOnce(&mut Job) -> Result<()> + Send>;

/// Durable key-value store keyed by job identifier (spec §4.3).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Only succeeds if `job.id` is absent (spec §8 scenario 5: duplicate
    /// submission is a `Conflict`).
    async fn create(&self, job: Job) -> Result<()>;

    /// Applies `transition` under compare-and-swap using the job's version
    /// counter, retrying the read-modify-write on conflict up to a bounded
    /// number of attempts.
    async fn update(&self, job_id: Uuid, transition: Transition) -> Result<Job>;

    async fn get(&self, job_id: Uuid) -> Result<Job>;

    async fn list(&self, filter: JobFilter, page: Page) -> Result<Vec<Job>>;

    /// Best-effort publish; subscribers who miss an event may reconcile by
    /// polling `get` (spec §4.3).
    async fn publish(&self, job_id: Uuid, event: ProgressEvent) -> Result<()>;

    /// Ordered stream of progress events for one job. The receiver only
    /// observes events published after it subscribes.
    async fn subscribe(&self, job_id: Uuid) -> Result<broadcast::Receiver<ProgressEvent>>;
}
