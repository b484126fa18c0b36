//! Filesystem Step (spec §4.7): walks the repository, merges a node per
//! directory/file by path, and links already-extracted symbol nodes to the
//! file that defines them. Grounded on the teacher's `IRStage::execute`
//! (parallel file walk + incremental-mode bookkeeping), generalized here to
//! a sequential `walkdir` + `ignore::gitignore` walk since node writes go
//! through a shared connection pool rather than an in-process cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ignore::gitignore::GitignoreBuilder;
use ingraph_pipeline::contract::{Step, StepOptions, StepStatus};
use ingraph_pipeline::error::{ErrorKind, Result, StepError};
use ingraph_storage::{Edge, EdgeKind, GraphStore, Identity, Mode, Node, NodeKind, Write};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::progress::JobTable;

const WRITE_RETRY: u32 = 3;

pub struct FilesystemStep {
    store: Arc<dyn GraphStore>,
    jobs: JobTable,
}

impl FilesystemStep {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            jobs: JobTable::new(),
        }
    }
}

#[async_trait]
impl Step for FilesystemStep {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn run(&self, job_id: Uuid, repo_path: PathBuf, options: StepOptions) -> Result<()> {
        let (status, cancellation) = self.jobs.start(job_id);
        let store = self.store.clone();
        let task = tokio::spawn(async move {
            let outcome = walk_repository(job_id, store, repo_path, options, status.clone(), cancellation.clone()).await;
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
}

fn dir_path_string(path: &Path) -> String {
    format!("{}/", path.to_string_lossy().trim_end_matches('/'))
}

fn file_path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Heuristic content-type classification by extension (spec §4.7
/// properties: "content-type (heuristic)").
fn content_type(extension: Option<&str>) -> &'static str {
    match extension {
        Some("py") => "text/x-python",
        Some("rs") => "text/rust",
        Some("js") => "application/javascript",
        Some("ts") | Some("tsx") => "application/typescript",
        Some("go") => "text/x-go",
        Some("java") => "text/x-java",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("toml") => "application/toml",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("txt") => "text/plain",
        Some(_) => "application/octet-stream",
        None => "application/octet-stream",
    }
}

fn extra_ignore_patterns(options: &StepOptions) -> Vec<String> {
    options
        .get("ignore_patterns")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn build_matcher(
    repo_path: &Path,
    options: &StepOptions,
) -> std::result::Result<ignore::gitignore::Gitignore, StepError> {
    let mut builder = GitignoreBuilder::new(repo_path);
    builder.add_line(None, ".git").ok();
    let gitignore_file = repo_path.join(".gitignore");
    if gitignore_file.is_file() {
        builder.add(&gitignore_file);
    }
    for pattern in extra_ignore_patterns(options) {
        builder
            .add_line(None, &pattern)
            .map_err(|e| StepError::new(ErrorKind::Configuration, format!("bad ignore pattern: {e}")))?;
    }
    builder
        .build()
        .map_err(|e| StepError::new(ErrorKind::Configuration, format!("failed to build ignore matcher: {e}")))
}

fn is_ignored(matcher: &ignore::gitignore::Gitignore, path: &Path, is_dir: bool) -> bool {
    matcher.matched(path, is_dir).is_ignore()
}

fn walk_entries(repo_path: &Path, matcher: &ignore::gitignore::Gitignore) -> Vec<walkdir::DirEntry> {
    WalkDir::new(repo_path)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(matcher, e.path(), e.file_type().is_dir()))
        .filter_map(|e| e.ok())
        .collect()
}

#[instrument(skip(store, status, cancellation), fields(job_id = %job_id))]
async fn walk_repository(
    job_id: Uuid,
    store: Arc<dyn GraphStore>,
    repo_path: PathBuf,
    options: StepOptions,
    status: Arc<parking_lot::Mutex<StepStatus>>,
    cancellation: CancellationToken,
) -> std::result::Result<(), StepError> {
    if !repo_path.is_dir() {
        return Err(StepError::new(
            ErrorKind::PermanentInput,
            format!("repository path is not a directory: {}", repo_path.display()),
        ));
    }

    let matcher = build_matcher(&repo_path, &options)?;
    let entries = walk_entries(&repo_path, &matcher);
    let total = entries.len().max(1);
    info!(total, "filesystem step: pre-scan complete");

    let repository_node = Node::new(NodeKind::Repository, Identity::path(dir_path_string(&repo_path)))
        .with_property(
            "name",
            serde_json::json!(repo_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| repo_path.to_string_lossy().to_string())),
        );
    let repository_key = repository_node.key();
    store
        .execute(Write::Node(repository_node), Mode::Write, WRITE_RETRY)
        .await
        .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;

    // path -> node key, seeded so the root directory's parent resolves.
    let mut node_keys: HashMap<PathBuf, String> = HashMap::new();
    // parent key -> child keys observed this run, for stale CONTAINS pruning.
    let mut observed: HashMap<String, HashSet<String>> = HashMap::new();
    observed.entry(repository_key.clone()).or_default();

    let mut processed = 0usize;
    for entry in &entries {
        if cancellation.is_cancelled() {
            info!("filesystem step: cancellation observed mid-walk");
            return Ok(());
        }

        let path = entry.path();
        if path == repo_path {
            // The repository root is already represented by `repository_node`
            // above; walking it again would write a duplicate Directory node.
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        let parent_path = path.parent().unwrap_or(&repo_path);
        let parent_key = node_keys
            .get(parent_path)
            .cloned()
            .unwrap_or_else(|| repository_key.clone());

        let node = if is_dir {
            Node::new(NodeKind::Directory, Identity::path(dir_path_string(path))).with_property(
                "name",
                serde_json::json!(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()),
            )
        } else {
            let metadata = entry.metadata().map_err(|e| {
                StepError::new(ErrorKind::PermanentInput, format!("unreadable file {}: {e}", path.display()))
            })?;
            let extension = path.extension().map(|e| e.to_string_lossy().to_string());
            let last_modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);
            let mut node = Node::new(NodeKind::File, Identity::path(file_path_string(path)))
                .with_property(
                    "name",
                    serde_json::json!(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()),
                )
                .with_property("size", serde_json::json!(metadata.len()))
                .with_property("content_type", serde_json::json!(content_type(extension.as_deref())));
            if let Some(ext) = &extension {
                node = node.with_property("extension", serde_json::json!(ext));
            }
            if let Some(modified) = last_modified {
                node = node.with_property("last_modified", serde_json::json!(modified.to_rfc3339()));
            }
            node
        };
        let node_key = node.key();
        node_keys.insert(path.to_path_buf(), node_key.clone());
        if is_dir {
            observed.entry(node_key.clone()).or_default();
        }

        store
            .execute(Write::Node(node), Mode::Write, WRITE_RETRY)
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;

        observed.entry(parent_key.clone()).or_default().insert(node_key.clone());
        let edge = Edge::new(EdgeKind::Contains, parent_key, node_key);
        store
            .execute(Write::Edge(edge), Mode::Write, WRITE_RETRY)
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;

        processed += 1;
        let percent = ((processed * 100) / total).min(100) as u8;
        *status.lock() = StepStatus::running(percent, format!("walked {processed}/{total}"));
    }

    prune_stale_contains(&store, &observed).await?;
    link_definitions(&store).await?;

    debug!(processed, "filesystem step: walk complete");
    Ok(())
}

/// Idempotency clause (spec §4.7): "removes `CONTAINS` edges for files no
/// longer present". `observed` holds every parent->children set actually
/// seen this run, including parents with zero remaining children.
async fn prune_stale_contains(
    store: &Arc<dyn GraphStore>,
    observed: &HashMap<String, HashSet<String>>,
) -> std::result::Result<(), StepError> {
    for (parent_key, children) in observed {
        let edges = store
            .edges_from(parent_key)
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
        for edge in edges {
            if edge.kind == EdgeKind::Contains && !children.contains(&edge.to_key) {
                warn!(from = %edge.from_key, to = %edge.to_key, "pruning stale CONTAINS edge");
                store
                    .delete_edge(&edge)
                    .await
                    .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
            }
        }
    }
    Ok(())
}

/// "After walk, queries existing AST nodes ... and links each to its
/// defining file by path match" (spec §4.7). Function/Class identities are
/// `NameInContainer { name, container }` where `container` is the file path
/// the AST step recorded; if that file was walked this run, link it.
async fn link_definitions(store: &Arc<dyn GraphStore>) -> std::result::Result<(), StepError> {
    for kind in [NodeKind::Function, NodeKind::Class] {
        let nodes = store
            .list_nodes(kind)
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
        for node in nodes {
            let Identity::NameInContainer { container, .. } = &node.identity else {
                continue;
            };
            let file_key = format!("{}:path:{container}", NodeKind::File.as_str());
            let file_exists = store
                .get_node(&file_key)
                .await
                .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?
                .is_some();
            if file_exists {
                let edge = Edge::new(EdgeKind::Defines, file_key, node.key());
                store
                    .execute(Write::Edge(edge), Mode::Write, WRITE_RETRY)
                    .await
                    .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
            }
        }
    }
    Ok(())
}
