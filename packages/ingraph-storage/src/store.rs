//! The `GraphStore` port (spec §4.1): the only contract callers depend on.
//! `infrastructure::sqlite` and `infrastructure::memory` provide adapters.

use crate::error::Result;
use crate::model::{Edge, Node, ScoredNode};
use async_trait::async_trait;

/// Read or write intent for a query, used by adapters to route to a
/// read-replica or the primary, and by retry policy (writes are never
/// retried blindly against a non-idempotent backend; ours always are,
/// merge-by-identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// A single merge-by-identity write: either a node upsert or an edge upsert.
/// Adapters never expose a raw "create" path for entity nodes (spec §4.1
/// idempotency clause).
#[derive(Debug, Clone)]
pub enum Write {
    Node(Node),
    Edge(Edge),
}

/// A scoped session bound to one transaction. Dropping it without an
/// explicit `commit`/`rollback` rolls back, guaranteeing release on every
/// exit path including early `?` returns and panics during unwind.
#[async_trait]
pub trait Session: Send {
    async fn write(&mut self, write: Write) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The graph store port. Implementations: `infrastructure::sqlite::SqliteGraphStore`
/// (reference backend) and `infrastructure::memory::InMemoryGraphStore` (test double).
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Idempotent. Creates uniqueness constraints per node kind/identity and
    /// prepares whatever vector-index support the backend offers.
    async fn initialize_schema(&self) -> Result<()>;

    /// A single merge-by-identity write, retried per the adapter's transient
    /// error policy up to `retry` attempts.
    async fn execute(&self, write: Write, mode: Mode, retry: u32) -> Result<()>;

    /// Atomic batch: all writes commit together or none do.
    async fn execute_batch(&self, writes: Vec<Write>, mode: Mode) -> Result<()>;

    /// Opens a session bound to a fresh transaction.
    async fn session(&self) -> Result<Box<dyn Session>>;

    /// Cosine-similarity nearest neighbors among nodes of `label`, descending
    /// by score, truncated to `limit`. Uses a native operator when the
    /// backend offers one; otherwise computes in-process (spec §4.1).
    async fn semantic_search(
        &self,
        embedding: &[f32],
        label: &str,
        limit: usize,
    ) -> Result<Vec<ScoredNode>>;

    /// Fetch a single node by its identity key, or `None`.
    async fn get_node(&self, key: &str) -> Result<Option<Node>>;

    /// All nodes of one kind. Typed query helper backing steps that need to
    /// enumerate existing entities (e.g. the Summarizer's DAG construction,
    /// the filesystem step's stale-edge pruning).
    async fn list_nodes(&self, kind: crate::model::NodeKind) -> Result<Vec<Node>>;

    /// Outgoing edges from a node, any kind.
    async fn edges_from(&self, from_key: &str) -> Result<Vec<Edge>>;

    /// Incoming edges to a node, any kind.
    async fn edges_to(&self, to_key: &str) -> Result<Vec<Edge>>;

    /// Removes one edge, if present. Used by steps that prune stale
    /// `CONTAINS`-style edges on re-run (spec §4.7 idempotency clause).
    async fn delete_edge(&self, edge: &Edge) -> Result<()>;
}

/// Exact cosine similarity between two equal-length vectors. Returns 0.0 for
/// a zero-magnitude vector rather than dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sorts `candidates` by descending cosine similarity to `query` and keeps
/// the top `limit`. Shared by every adapter's in-process fallback path so the
/// ordering and tie-breaking behavior is identical across backends.
pub fn rank_by_similarity(
    query: &[f32],
    candidates: Vec<Node>,
    limit: usize,
) -> Vec<ScoredNode> {
    let mut scored: Vec<ScoredNode> = candidates
        .into_iter()
        .filter_map(|node| {
            node.embedding
                .as_ref()
                .map(|emb| cosine_similarity(query, emb))
                .map(|score| ScoredNode { node, score })
        })
        .collect();
    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}
