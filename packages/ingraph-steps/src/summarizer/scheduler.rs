//! Bounded-parallel, dependency-ordered scheduling over the Summarizer DAG
//! (spec §4.9 "Scheduling"). Grounded on the teacher's
//! `ReverseDependencyIndex`/`compute_affected_files` reverse-edge bookkeeping
//! idiom, adapted from BFS-to-affected-files into a ready-set worker pool:
//! a node enters the ready set once every predecessor is `summarized`, and a
//! `tokio::sync::Semaphore(C)` bounds how many run concurrently across the
//! *entire* DAG, not per level (spec §4.9: "Parallelism within the cap is
//! across the entire DAG, not per level").

use dashmap::DashMap;
use ingraph_llm::LlmGateway;
use ingraph_storage::GraphStore;
use petgraph::graph::NodeIndex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dag::DependencyDag;
use super::generate::{extract_content, generate_summary, summary_node_key, write_placeholder_summary};

/// Terminal state of one DAG unit (spec §4.9 "States per node"). `Ready`/
/// `Pending`/`Running` are transient and not tracked once a unit finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Summarized,
    Failed,
    Skipped,
}

/// Aggregate result of one Summarizer run (spec §4.9 "Failure semantics").
pub struct SchedulerOutcome {
    pub total: usize,
    pub summarized: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

struct SharedState {
    remaining_predecessors: DashMap<NodeIndex, usize>,
    outcomes: DashMap<NodeIndex, UnitOutcome>,
    summary_text: DashMap<NodeIndex, String>,
    errors: Mutex<Vec<String>>,
    completed: AtomicUsize,
}

/// Runs the full dependency-ordered summarization over `dag`, reporting
/// progress through `on_progress(summarized, total)` on every completion
/// (spec §4.9 "Progress": `summarized_nodes / total_nodes x 100`).
pub async fn run<P>(
    dag: Arc<DependencyDag>,
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    concurrency: usize,
    update_mode: bool,
    cancellation: CancellationToken,
    on_progress: P,
) -> SchedulerOutcome
where
    P: Fn(usize, usize) + Send + Sync + 'static,
{
    let total = dag.len();
    if total == 0 {
        return SchedulerOutcome {
            total: 0,
            summarized: 0,
            failed: 0,
            errors: Vec::new(),
            cancelled: false,
        };
    }

    let remaining_predecessors = DashMap::new();
    for (idx, _) in dag.units() {
        remaining_predecessors.insert(idx, dag.predecessors(idx).len());
    }

    let shared = Arc::new(SharedState {
        remaining_predecessors,
        outcomes: DashMap::new(),
        summary_text: DashMap::new(),
        errors: Mutex::new(Vec::new()),
        completed: AtomicUsize::new(0),
    });

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<NodeIndex>();

    let mut ready: VecDeque<NodeIndex> = dag.roots().into();
    let mut dispatched: HashSet<NodeIndex> = HashSet::new();
    let mut in_flight = 0usize;
    let on_progress = Arc::new(on_progress);
    let mut cancelled = false;

    while dispatched.len() < total {
        if cancellation.is_cancelled() {
            cancelled = true;
            break;
        }

        while let Some(idx) = ready.pop_front() {
            if dispatched.contains(&idx) {
                continue;
            }
            dispatched.insert(idx);
            in_flight += 1;

            let dag = dag.clone();
            let store = store.clone();
            let gateway = gateway.clone();
            let shared = shared.clone();
            let done_tx = done_tx.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let cancellation = cancellation.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let outcome = summarize_unit(&dag, &store, &gateway, idx, update_mode, &shared, &cancellation).await;
                shared.outcomes.insert(idx, outcome);
                let _ = done_tx.send(idx);
            });
        }

        if in_flight == 0 {
            break; // nothing ready and nothing in flight: DAG exhausted.
        }

        let Some(finished) = done_rx.recv().await else {
            break;
        };
        in_flight -= 1;

        let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        on_progress(completed, total);

        for successor in dag.successors(finished) {
            let mut count = shared
                .remaining_predecessors
                .get_mut(&successor)
                .expect("successor tracked in remaining_predecessors");
            *count -= 1;
            if *count == 0 {
                ready.push_back(successor);
            }
        }
    }

    let summarized = shared
        .outcomes
        .iter()
        .filter(|e| *e.value() == UnitOutcome::Summarized)
        .count();
    let failed = shared
        .outcomes
        .iter()
        .filter(|e| *e.value() == UnitOutcome::Failed)
        .count();

    if cancelled {
        info!(dispatched = dispatched.len(), total, "summarizer cancelled mid-run");
    }

    SchedulerOutcome {
        total,
        summarized,
        failed,
        errors: shared.errors.lock().await.clone(),
        cancelled,
    }
}

/// Generates (or skips, per at-most-once) the summary for one DAG unit.
/// Checks the cancellation flag immediately before the LLM call (spec §5
/// "Suspension points": "before each LLM call").
async fn summarize_unit(
    dag: &DependencyDag,
    store: &Arc<dyn GraphStore>,
    gateway: &LlmGateway,
    idx: NodeIndex,
    update_mode: bool,
    shared: &SharedState,
    cancellation: &CancellationToken,
) -> UnitOutcome {
    let unit = dag.unit(idx);

    let predecessor_failed = dag
        .predecessors(idx)
        .iter()
        .any(|p| shared.outcomes.get(p).map(|o| *o == UnitOutcome::Failed).unwrap_or(false));

    if predecessor_failed {
        if let Err(err) = write_placeholder_summary(store, unit).await {
            warn!(unit = %unit.unit_key(), error = %err, "failed to write placeholder summary");
        }
        return UnitOutcome::Skipped;
    }

    if cancellation.is_cancelled() {
        return UnitOutcome::Skipped;
    }

    let predecessor_summaries: Vec<String> = dag
        .predecessors(idx)
        .iter()
        .filter_map(|p| shared.summary_text.get(p).map(|s| s.clone()))
        .collect();
    let content = extract_content(unit, &predecessor_summaries);

    match generate_summary(store, gateway, unit, content, update_mode).await {
        Ok(()) => {
            if let Ok(Some(node)) = store.get_node(&summary_node_key(unit)).await {
                if let Some(text) = node.properties.get("text").and_then(|v| v.as_str()) {
                    shared.summary_text.insert(idx, text.to_string());
                }
            }
            UnitOutcome::Summarized
        }
        Err(err) => {
            warn!(unit = %unit.unit_key(), error = %err, "summary generation failed");
            shared.errors.lock().await.push(format!("{}: {err}", unit.unit_key()));
            UnitOutcome::Failed
        }
    }
}
