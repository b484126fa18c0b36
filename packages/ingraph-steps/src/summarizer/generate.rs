//! Per-node summary generation (spec §4.9 "Per-node generation",
//! "At-most-once"). Extracts content for a `SummaryUnit`, selects a prompt
//! template by node kind, calls the LLM Gateway's `chat` then `embed`, and
//! merges the resulting `Summary` node plus its `SUMMARIZED_BY` edge in one
//! write.

use chrono::Utc;
use ingraph_llm::{CallOptions, ChatMessage, LlmGateway, Role};
use ingraph_pipeline::error::{ErrorKind, Result as StepResult, StepError};
use ingraph_storage::{Edge, EdgeKind, GraphStore, Identity, Mode, Node, NodeKind, Write};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::dag::SummaryUnit;

/// Truncation budget applied to raw source content before it is templated
/// into a prompt (spec §4.9 "truncated to a token budget with
/// boundary-aware trimming"). Measured in characters as a stand-in for
/// tokens — the gateway's own provider is responsible for exact tokenization.
const CONTENT_CHAR_BUDGET: usize = 6_000;

/// Trims `text` to at most `budget` characters, preferring to cut at a
/// line boundary so a function body isn't sheared mid-statement.
fn trim_to_budget(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let slice = &text[..budget];
    match slice.rfind('\n') {
        Some(cut) if cut > budget / 2 => slice[..cut].to_string(),
        _ => slice.to_string(),
    }
}

/// Selects the node-kind-keyed prompt template (spec §4.9 step 2: `{File,
/// Class, Function, Method, Directory, Module, Repository}`).
fn template_for(kind: NodeKind, name: &str, content: &str) -> String {
    match kind {
        NodeKind::File => format!(
            "Summarize the purpose and responsibilities of the file `{name}`. \
             Focus on what it provides to the rest of the codebase.\n\n{content}"
        ),
        NodeKind::Class => format!(
            "Summarize the class `{name}`: its responsibility, key methods, and \
             how it fits into its module.\n\n{content}"
        ),
        NodeKind::Function => format!(
            "Summarize what the function `{name}` does, its inputs/outputs, and \
             any notable side effects.\n\n{content}"
        ),
        NodeKind::Module => format!(
            "Summarize the module `{name}` based on the summaries of its members.\n\n{content}"
        ),
        NodeKind::Directory => format!(
            "Summarize the directory `{name}` based on the summaries of its contents.\n\n{content}"
        ),
        NodeKind::Repository => format!(
            "Write a top-level summary of this repository based on the summaries \
             of its top-level directories and files.\n\n{content}"
        ),
        NodeKind::Summary | NodeKind::Documentation => {
            format!("Summarize: {name}\n\n{content}")
        }
    }
}

/// Extracts the content to summarize a `SummaryUnit` over (spec §4.9 step
/// 1): raw source text for file/function-like leaves, or stitched-together
/// member summaries for directories/modules/SCC super-nodes.
/// `predecessor_summaries` holds the already-generated summary text of every
/// DAG predecessor of this unit — the scheduler only runs a unit once every
/// predecessor has been summarized, so these are always available by then.
pub fn extract_content(unit: &SummaryUnit, predecessor_summaries: &[String]) -> String {
    if unit.is_scc() {
        let mut parts = Vec::new();
        for member in &unit.members {
            let text = member
                .properties
                .get("source_text")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            parts.push(format!("--- {} ---\n{}", member.key(), text));
        }
        return trim_to_budget(&parts.join("\n\n"), CONTENT_CHAR_BUDGET);
    }

    let node = &unit.members[0];
    match node.kind {
        NodeKind::File | NodeKind::Function | NodeKind::Class => {
            let text = node
                .properties
                .get("source_text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            trim_to_budget(&text, CONTENT_CHAR_BUDGET)
        }
        NodeKind::Directory | NodeKind::Module | NodeKind::Repository => {
            trim_to_budget(&predecessor_summaries.join("\n\n"), CONTENT_CHAR_BUDGET)
        }
        NodeKind::Summary | NodeKind::Documentation => String::new(),
    }
}

/// Content-addressed hash used for the at-most-once check (spec §4.9
/// "before generating, the worker checks for an existing `Summary` node ...
/// whose source-content hash matches the current hash").
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn unit_name(unit: &SummaryUnit) -> String {
    if unit.is_scc() {
        return format!("<cycle of {}>", unit.members.len());
    }
    match &unit.members[0].identity {
        Identity::Path(p) => p.clone(),
        Identity::NameInContainer { name, .. } => name.clone(),
    }
}

fn unit_kind(unit: &SummaryUnit) -> NodeKind {
    unit.members[0].kind
}

/// The identity key of the `Summary` node for `unit`, stable across runs.
/// Exposed so the scheduler can look up an already-generated summary's text
/// without reimplementing the identity derivation.
pub fn summary_node_key(unit: &SummaryUnit) -> String {
    let target_key = unit.unit_key();
    let summary_identity = Identity::named(unit_name(unit), target_key);
    Node::new(NodeKind::Summary, summary_identity).key()
}

/// Generates (or reuses) the summary for one `SummaryUnit` and writes it
/// transactionally: merge the `Summary` node keyed by target identity, set
/// text/embedding/hash, and create the `SUMMARIZED_BY` edge (spec §4.9 step
/// 5, §3 "a `Summary` node is reachable from exactly one target code node").
///
/// `update_mode=false` with an unchanged content hash skips the LLM call
/// entirely (spec §4.9 "At-most-once"; §8 "Summarizer with update_mode=false
/// and unchanged content performs zero LLM calls on the second run").
pub async fn generate_summary(
    store: &Arc<dyn GraphStore>,
    gateway: &LlmGateway,
    unit: &SummaryUnit,
    content: String,
    update_mode: bool,
) -> StepResult<()> {
    let target_key = unit.unit_key();
    let hash = content_hash(&content);
    let summary_identity = Identity::named(unit_name(unit), target_key.clone());
    let summary_node_key = Node::new(NodeKind::Summary, summary_identity.clone()).key();

    if !update_mode {
        if let Ok(Some(existing)) = store.get_node(&summary_node_key).await {
            if existing.properties.get("content_hash").and_then(|v| v.as_str()) == Some(hash.as_str()) {
                return Ok(()); // at-most-once: reuse, no LLM call.
            }
        }
    }

    let kind = unit_kind(unit);
    let name = unit_name(unit);
    let prompt = template_for(kind, &name, &content);

    let chat_response = gateway
        .chat(Role::Chat, vec![ChatMessage::user(prompt)], CallOptions::default())
        .await
        .map_err(|e| {
            StepError::new(ErrorKind::PartialData, format!("summary generation failed for {target_key}: {e}"))
        })?;

    let embed_response = gateway
        .embed(chat_response.message.content.clone())
        .await
        .map_err(|e| {
            StepError::new(ErrorKind::PartialData, format!("embedding failed for {target_key}: {e}"))
        })?;

    let summary_node = Node::new(NodeKind::Summary, summary_identity)
        .with_property("target", serde_json::json!(target_key))
        .with_property("text", serde_json::json!(chat_response.message.content))
        .with_property("content_hash", serde_json::json!(hash))
        .with_property("generated_at", serde_json::json!(Utc::now().to_rfc3339()))
        .with_embedding(embed_response.embedding);
    let summary_key = summary_node.key();

    let edge = Edge::new(EdgeKind::SummarizedBy, target_key, summary_key);

    store
        .execute_batch(vec![Write::Node(summary_node), Write::Edge(edge)], Mode::Write)
        .await
        .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;

    Ok(())
}

/// A placeholder summary written for a node whose predecessor failed (spec
/// §4.9 "Failure semantics": "its successors whose only failed predecessor
/// is this node proceed with a placeholder note").
pub async fn write_placeholder_summary(store: &Arc<dyn GraphStore>, unit: &SummaryUnit) -> StepResult<()> {
    let target_key = unit.unit_key();
    let summary_identity = Identity::named(unit_name(unit), target_key.clone());
    let summary_node = Node::new(NodeKind::Summary, summary_identity)
        .with_property("target", serde_json::json!(target_key.clone()))
        .with_property(
            "text",
            serde_json::json!("(summary unavailable: a dependency failed to summarize)"),
        )
        .with_property("placeholder", serde_json::json!(true));
    let summary_key = summary_node.key();
    let edge = Edge::new(EdgeKind::SummarizedBy, target_key, summary_key);
    store
        .execute_batch(vec![Write::Node(summary_node), Write::Edge(edge)], Mode::Write)
        .await
        .map_err(|e| StepError::new(ErrorKind::TransientInfrastructure, e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingraph_llm::{GatewayConfig, LlmGateway, ModelRoutes};
    use ingraph_llm::MockProvider;
    use ingraph_storage::InMemoryGraphStore;

    fn gateway(text: &str) -> LlmGateway {
        LlmGateway::new(
            Arc::new(MockProvider::canned(text)),
            ModelRoutes::new("chat-model", "reasoning-model", "embed-model"),
            GatewayConfig::default(),
        )
    }

    fn file_unit(path: &str, source: &str) -> SummaryUnit {
        let node = Node::new(NodeKind::File, Identity::path(path))
            .with_property("source_text", serde_json::json!(source));
        SummaryUnit { members: vec![node] }
    }

    #[test]
    fn test_trim_to_budget_cuts_at_line_boundary() {
        let text = "a\n".repeat(10);
        let trimmed = trim_to_budget(&text, 5);
        assert!(trimmed.len() <= 5);
        assert!(!trimmed.ends_with('a'));
    }

    #[test]
    fn test_trim_to_budget_noop_under_budget() {
        assert_eq!(trim_to_budget("short", 100), "short");
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("same text"), content_hash("same text"));
        assert_ne!(content_hash("a"), content_hash("b"));
    }

    #[tokio::test]
    async fn test_generate_summary_writes_node_and_edge() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let unit = file_unit("main.py", "def greet():\n    pass\n");
        let gateway = gateway("greet() prints a greeting");

        generate_summary(&store, &gateway, &unit, "def greet(): pass".into(), true)
            .await
            .unwrap();

        let summaries = store.list_nodes(NodeKind::Summary).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(
            summaries[0].properties.get("text").and_then(|v| v.as_str()),
            Some("greet() prints a greeting")
        );
        assert!(summaries[0].embedding.is_some());

        let edges = store.edges_to(&summaries[0].key()).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].kind, EdgeKind::SummarizedBy);
    }

    #[tokio::test]
    async fn test_at_most_once_skips_llm_when_hash_matches() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let unit = file_unit("main.py", "def greet(): pass");

        generate_summary(&store, &gateway("first summary"), &unit, "content-v1".into(), false)
            .await
            .unwrap();

        // Second run, update_mode=false, same content -> no new LLM call;
        // the gateway below would overwrite the text if it were invoked.
        let second_gateway = gateway("should never be written");
        generate_summary(&store, &second_gateway, &unit, "content-v1".into(), false)
            .await
            .unwrap();
        assert_eq!(second_gateway.metrics().snapshot().requests_total, 0);

        let summaries = store.list_nodes(NodeKind::Summary).await.unwrap();
        assert_eq!(
            summaries[0].properties.get("text").and_then(|v| v.as_str()),
            Some("first summary")
        );
    }

    #[tokio::test]
    async fn test_update_mode_true_always_regenerates() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let unit = file_unit("main.py", "def greet(): pass");

        generate_summary(&store, &gateway("summary one"), &unit, "content".into(), true)
            .await
            .unwrap();
        generate_summary(&store, &gateway("summary two"), &unit, "content".into(), true)
            .await
            .unwrap();

        let summaries = store.list_nodes(NodeKind::Summary).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(
            summaries[0].properties.get("text").and_then(|v| v.as_str()),
            Some("summary two")
        );
    }

    #[tokio::test]
    async fn test_placeholder_summary_is_marked() {
        let store: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let unit = file_unit("broken.py", "");
        write_placeholder_summary(&store, &unit).await.unwrap();
        let summaries = store.list_nodes(NodeKind::Summary).await.unwrap();
        assert_eq!(summaries[0].properties.get("placeholder"), Some(&serde_json::json!(true)));
    }
}
