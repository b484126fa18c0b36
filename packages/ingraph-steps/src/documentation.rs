//! Documentation Step (spec §4.10): discovers documentation files, parses
//! them per format, matches code references by heuristic, and creates
//! `Documentation` nodes with `DOCUMENTED_BY` edges to matched code nodes.
//! Grounded on the `FilesystemStep`'s walk + `JobTable` shape; Markdown
//! parsing uses `pulldown_cmark` the way the teacher's documentation
//! generation reaches for it.

use async_trait::async_trait;
use ingraph_llm::LlmGateway;
use ingraph_pipeline::contract::{Step, StepOptions, StepStatus};
use ingraph_pipeline::error::{ErrorKind, Result, StepError};
use ingraph_storage::{Edge, EdgeKind, GraphStore, Identity, Mode, Node, NodeKind, Write};
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::progress::JobTable;

const WRITE_RETRY: u32 = 3;

const DOC_EXTENSIONS: &[&str] = &["md", "rst", "adoc", "txt"];
const DOC_FILENAMES: &[&str] = &["README", "CHANGELOG", "CONTRIBUTING"];

pub struct DocumentationStep {
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    jobs: JobTable,
}

impl DocumentationStep {
    pub fn new(store: Arc<dyn GraphStore>, gateway: Arc<LlmGateway>) -> Self {
        Self {
            store,
            gateway,
            jobs: JobTable::new(),
        }
    }
}

#[async_trait]
impl Step for DocumentationStep {
    fn name(&self) -> &str {
        "documentation"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["filesystem".to_string(), "ast".to_string()]
    }

    async fn run(&self, job_id: Uuid, repo_path: PathBuf, options: StepOptions) -> Result<()> {
        let (status, cancellation) = self.jobs.start(job_id);
        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let task = tokio::spawn(async move {
            let outcome = walk_documentation(job_id, store, gateway, repo_path, options, status.clone(), cancellation.clone()).await;
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

fn is_doc_file(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if DOC_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| DOC_FILENAMES.iter().any(|known| stem.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

fn doc_format(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") => "markdown",
        Some("rst") => "restructuredtext",
        Some("adoc") => "asciidoc",
        _ => "plaintext",
    }
}

/// Strips Markdown to plain prose text and collects inline code-span
/// candidates, which are the highest-signal symbol references (spec §4.10
/// "inline code-spans").
fn parse_markdown(content: &str) -> (String, Vec<String>) {
    let mut text = String::new();
    let mut code_spans = Vec::new();
    let mut in_code_block = false;

    for event in Parser::new(content) {
        match event {
            Event::Start(Tag::CodeBlock(_)) => in_code_block = true,
            Event::End(TagEnd::CodeBlock) => in_code_block = false,
            Event::Code(code) => code_spans.push(code.to_string()),
            Event::Text(t) if !in_code_block => {
                text.push_str(&t);
                text.push(' ');
            }
            _ => {}
        }
    }
    (text, code_spans)
}

/// Path-like and dotted-qualified-name references in plain prose (spec
/// §4.10 "paths, qualified names"), e.g. `src/utils.py` or `module.Class`.
fn reference_regex() -> Regex {
    Regex::new(r"[A-Za-z0-9_./-]+\.[A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*").expect("static regex is valid")
}

fn prose_references(text: &str) -> Vec<String> {
    reference_regex().find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Resolves a heuristic reference candidate to an existing code node's key,
/// trying a path match first (files), then a bare-name match among
/// functions and classes (spec §4.10 "heuristic matching").
async fn resolve_candidate(
    store: &Arc<dyn GraphStore>,
    candidate: &str,
    functions_and_classes: &[Node],
) -> Option<String> {
    let file_key = format!("{}:path:{candidate}", NodeKind::File.as_str());
    if let Ok(Some(node)) = store.get_node(&file_key).await {
        return Some(node.key());
    }

    let bare_name = candidate.rsplit(['.', '/']).next().unwrap_or(candidate);
    functions_and_classes
        .iter()
        .find(|n| matches!(&n.identity, Identity::NameInContainer { name, .. } if name == bare_name))
        .map(Node::key)
}

#[instrument(skip(store, gateway, status, cancellation), fields(job_id = %job_id))]
async fn walk_documentation(
    job_id: Uuid,
    store: Arc<dyn GraphStore>,
    gateway: Arc<LlmGateway>,
    repo_path: PathBuf,
    _options: StepOptions,
    status: Arc<parking_lot::Mutex<StepStatus>>,
    cancellation: CancellationToken,
) -> std::result::Result<(), StepError> {
    if !repo_path.is_dir() {
        return Err(StepError::new(
            ErrorKind::PermanentInput,
            format!("repository path is not a directory: {}", repo_path.display()),
        ));
    }

    let doc_paths: Vec<PathBuf> = WalkDir::new(&repo_path)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_doc_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();

    let total = doc_paths.len().max(1);
    info!(total, "documentation step: discovered doc files");

    let mut functions_and_classes = Vec::new();
    for kind in [NodeKind::Function, NodeKind::Class] {
        functions_and_classes.extend(
            store
                .list_nodes(kind)
                .await
                .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?,
        );
    }

    let mut processed = 0usize;
    for path in &doc_paths {
        if cancellation.is_cancelled() {
            info!("documentation step: cancellation observed mid-walk");
            return Ok(());
        }

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable documentation file");
                continue;
            }
        };

        let (plain_text, code_spans) = match doc_format(path) {
            "markdown" => parse_markdown(&content),
            _ => (content.clone(), Vec::new()),
        };

        let mut candidates: HashSet<String> = code_spans.into_iter().collect();
        candidates.extend(prose_references(&plain_text));
        candidates.extend(prose_references(&content));

        let embedding = gateway
            .embed(plain_text.clone())
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, format!("doc embedding failed: {e}")))?;

        let rel_path = path.strip_prefix(&repo_path).unwrap_or(path).to_string_lossy().to_string();
        let doc_node = Node::new(NodeKind::Documentation, Identity::path(rel_path.clone()))
            .with_property("format", serde_json::json!(doc_format(path)))
            .with_property("text", serde_json::json!(plain_text.trim()))
            .with_embedding(embedding.embedding);
        let doc_key = doc_node.key();

        store
            .execute(Write::Node(doc_node), Mode::Write, WRITE_RETRY)
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;

        let existing_edges = store
            .edges_from(&doc_key)
            .await
            .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;

        let mut matched_keys = HashSet::new();
        for candidate in &candidates {
            if let Some(code_key) = resolve_candidate(&store, candidate, &functions_and_classes).await {
                if matched_keys.insert(code_key.clone()) {
                    let edge = Edge::new(EdgeKind::DocumentedBy, doc_key.clone(), code_key);
                    store
                        .execute(Write::Edge(edge), Mode::Write, WRITE_RETRY)
                        .await
                        .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
                }
            }
        }

        for edge in existing_edges {
            if edge.kind == EdgeKind::DocumentedBy && !matched_keys.contains(&edge.to_key) {
                store
                    .delete_edge(&edge)
                    .await
                    .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
            }
        }

        processed += 1;
        let percent = ((processed * 100) / total).min(100) as u8;
        *status.lock() = StepStatus::running(percent, format!("documented {processed}/{total}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingraph_llm::{GatewayConfig, MockProvider, ModelRoutes};
    use ingraph_storage::InMemoryGraphStore;
    use std::time::Duration;
    use tempfile::TempDir;

    fn gateway() -> Arc<LlmGateway> {
        Arc::new(LlmGateway::new(
            Arc::new(MockProvider::canned("doc text")),
            ModelRoutes::new("chat", "reasoning", "embed"),
            GatewayConfig::default(),
        ))
    }

    async fn run_to_completion(step: &DocumentationStep, job_id: Uuid, repo: &Path) {
        step.run(job_id, repo.to_path_buf(), serde_json::json!({})).await.unwrap();
        for _ in 0..200 {
            let status = step.status(job_id).await.unwrap();
            if status.state.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("documentation step did not terminate");
    }

    #[test]
    fn test_is_doc_file_matches_known_extensions_and_names() {
        assert!(is_doc_file(Path::new("docs/guide.md")));
        assert!(is_doc_file(Path::new("README")));
        assert!(is_doc_file(Path::new("README.md")));
        assert!(!is_doc_file(Path::new("src/main.py")));
    }

    #[test]
    fn test_parse_markdown_extracts_code_spans_and_skips_code_blocks() {
        let content = "See `greet()` for details.\n\n```py\nskip_this_symbol()\n```\n";
        let (text, spans) = parse_markdown(content);
        assert!(text.contains("See"));
        assert!(!text.contains("skip_this_symbol"));
        assert_eq!(spans, vec!["greet()".to_string()]);
    }

    #[test]
    fn test_prose_references_finds_dotted_and_path_like_tokens() {
        let refs = prose_references("See src/main.py and module.Class for usage.");
        assert!(refs.iter().any(|r| r == "src/main.py"));
        assert!(refs.iter().any(|r| r == "module.Class"));
    }

    #[tokio::test]
    async fn test_documentation_node_created_with_embedding() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("README.md"), "# Hello\n\nThis project says hi.\n").unwrap();

        let step = DocumentationStep::new(store.clone(), gateway());
        let job_id = Uuid::new_v4();
        run_to_completion(&step, job_id, repo.path()).await;

        let status = step.status(job_id).await.unwrap();
        assert_eq!(status.state, ingraph_jobs::StepState::Completed);

        let docs = store.list_nodes(NodeKind::Documentation).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_code_span_matches_existing_function_node() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let greet_fn = Node::new(NodeKind::Function, Identity::named("greet", "src/main.py"));
        let greet_key = greet_fn.key();
        store.execute(Write::Node(greet_fn), Mode::Write, 1).await.unwrap();

        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("README.md"), "Call `greet` to say hello.\n").unwrap();

        let step = DocumentationStep::new(store.clone(), gateway());
        let job_id = Uuid::new_v4();
        run_to_completion(&step, job_id, repo.path()).await;

        let docs = store.list_nodes(NodeKind::Documentation).await.unwrap();
        let edges = store.edges_from(&docs[0].key()).await.unwrap();
        assert!(edges.iter().any(|e| e.kind == EdgeKind::DocumentedBy && e.to_key == greet_key));
    }
}
