//! Summarizer Step (spec §4.9): builds the repository's dependency DAG,
//! then generates a `Summary` node per code entity in dependency order with
//! a bounded-parallel worker pool, leaves first. Grounded on the
//! `FilesystemStep`'s `JobTable`-backed run/status/stop/cancel shape; the
//! DAG construction and scheduling are specific to this step (see `dag` and
//! `scheduler`).

pub mod dag;
pub mod generate;
pub mod scheduler;

use async_trait::async_trait;
use ingraph_llm::LlmGateway;
use ingraph_pipeline::contract::{Step, StepOptions, StepStatus};
use ingraph_pipeline::error::{ErrorKind, Result, StepError};
use ingraph_storage::GraphStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::progress::JobTable;

const DEFAULT_CONCURRENCY: usize = 5;

pub struct SummarizerStep {
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    jobs: JobTable,
}

impl SummarizerStep {
    pub fn new(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>) -> Self {
        Self {
            store,
            gateway,
            jobs: JobTable::new(),
        }
    }
}

fn concurrency_from(options: &StepOptions) -> usize {
    options
        .get("concurrency")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_CONCURRENCY)
}

fn update_mode_from(options: &StepOptions) -> bool {
    options.get("update_mode").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Fraction of units allowed to fail before the step itself fails (spec
/// §4.9/§9 "failure ratio ≤ threshold"), default `0` (any failure fails
/// the step).
fn threshold_from(options: &StepOptions) -> f64 {
    options.get("failure_threshold").and_then(|v| v.as_f64()).unwrap_or(0.0)
}

#[async_trait]
impl Step for SummarizerStep {
    fn name(&self) -> &str {
        "summarizer"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["filesystem".to_string(), "ast".to_string()]
    }

    async fn run(&self, job_id: Uuid, _repo_path: PathBuf, options: StepOptions) -> Result<()> {
        let (status, cancellation) = self.jobs.start(job_id);
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let concurrency = concurrency_from(&options);
        let update_mode = update_mode_from(&options);
        let threshold = threshold_from(&options);

        let task = tokio::spawn(async move {
            let outcome = summarize(job_id, store, gateway, concurrency, update_mode, threshold, status.clone(), cancellation.clone()).await;
            match outcome {
                Ok(()) if cancellation.is_cancelled() => *status.lock() = StepStatus::cancelled(),
                Ok(()) => *status.lock() = StepStatus::completed(),
                Err(err) => *status.lock() = StepStatus::failed(err),
            }
        });
        self.jobs.attach_task(job_id, task);
        Ok(())
    }

    async fn status(&self, job_id: Uuid) -> Result<StepStatus> {
        self.jobs.status(job_id)
    }

    async fn stop(&self, job_id: Uuid) -> Result<()> {
        self.jobs.stop(job_id);
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.jobs.cancel(job_id);
        Ok(())
    }

    /// Incremental re-run (spec §4.4 `ingestion_update`): identical to `run`
    /// with `update_mode` forced on, so every unit's content hash is
    /// re-checked and only changed entities regenerate (spec §4.9
    /// "At-most-once").
    async fn ingestion_update(&self, job_id: Uuid, repo_path: PathBuf, options: StepOptions) -> Result<()> {
        let mut options = options;
        if let Some(obj) = options.as_object_mut() {
            obj.insert("update_mode".to_string(), serde_json::json!(true));
        }
        self.run(job_id, repo_path, options).await
    }
}

#[instrument(skip(store, gateway, status, cancellation), fields(job_id = %job_id))]
async fn summarize(
    job_id: Uuid,
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    concurrency: usize,
    update_mode: bool,
    failure_threshold: f64,
    status: Arc<parking_lot::Mutex<StepStatus>>,
    cancellation: CancellationToken,
) -> std::result::Result<(), StepError> {
    let built = dag::build_dag(&store)
        .await
        .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
    let total = built.len();
    info!(total, "summarizer: dag built");

    if built.is_empty() {
        *status.lock() = StepStatus::running(100, "no entities to summarize");
        return Ok(());
    }

    let dag = Arc::new(built);
    let progress_status = status.clone();
    let outcome = scheduler::run(dag, store, gateway, concurrency, update_mode, cancellation.clone(), move |done, total| {
        let percent = ((done * 100) / total.max(1)).min(100) as u8;
        *progress_status.lock() = StepStatus::running(percent, format!("summarized {done}/{total}"));
    })
    .await;

    if outcome.cancelled {
        info!(job_id = %job_id, "summarizer cancelled mid-run");
        return Ok(());
    }

    let failure_ratio = outcome.failed as f64 / outcome.total.max(1) as f64;
    if failure_ratio > failure_threshold {
        return Err(StepError::new(
            ErrorKind::PartialData,
            format!(
                "{} of {} units failed to summarize (ratio {:.3} exceeds threshold {:.3})",
                outcome.failed, outcome.total, failure_ratio, failure_threshold
            ),
        )
        .with_context(serde_json::json!({ "errors": outcome.errors })));
    }

    Ok(())
}
