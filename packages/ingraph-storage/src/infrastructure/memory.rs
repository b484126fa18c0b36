//! In-memory `GraphStore`, the adapter behind unit tests throughout the
//! workspace — mirrors the teacher's `CheckpointManager::new_in_memory` idiom
//! of offering a zero-setup store with identical semantics to the real one.

use crate::error::Result;
use crate::model::{Edge, Node};
use crate::store::{rank_by_similarity, GraphStore, Mode, Session, Write};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    edges: Vec<Edge>,
}

impl State {
    fn apply(&mut self, write: Write) {
        match write {
            Write::Node(node) => {
                let key = node.key();
                match self.nodes.get_mut(&key) {
                    Some(existing) => {
                        existing.properties.extend(node.properties);
                        if node.embedding.is_some() {
                            existing.embedding = node.embedding;
                        }
                        existing.updated_at = Some(node.created_at);
                    }
                    None => {
                        self.nodes.insert(key, node);
                    }
                }
            }
            Write::Edge(edge) => {
                let exists = self.edges.iter().any(|e| {
                    e.kind == edge.kind && e.from_key == edge.from_key && e.to_key == edge.to_key
                });
                if !exists {
                    self.edges.push(edge);
                }
            }
        }
    }
}

/// In-memory graph store. Not durable; intended for unit and integration
/// tests of steps and the orchestrator.
pub struct InMemoryGraphStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.lock().edges.len()
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemorySession {
    state: Arc<Mutex<State>>,
    pending: Vec<Write>,
}

#[async_trait]
impl Session for InMemorySession {
    async fn write(&mut self, write: Write) -> Result<()> {
        self.pending.push(write);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        for write in self.pending {
            state.apply(write);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn initialize_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, write: Write, _mode: Mode, _retry: u32) -> Result<()> {
        self.state.lock().apply(write);
        Ok(())
    }

    async fn execute_batch(&self, writes: Vec<Write>, _mode: Mode) -> Result<()> {
        let mut state = self.state.lock();
        for write in writes {
            state.apply(write);
        }
        Ok(())
    }

    async fn session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(InMemorySession {
            state: self.state.clone(),
            pending: Vec::new(),
        }))
    }

    async fn semantic_search(
        &self,
        embedding: &[f32],
        label: &str,
        limit: usize,
    ) -> Result<Vec<crate::model::ScoredNode>> {
        let candidates: Vec<Node> = self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| n.kind.as_str() == label)
            .cloned()
            .collect();
        Ok(rank_by_similarity(embedding, candidates, limit))
    }

    async fn get_node(&self, key: &str) -> Result<Option<Node>> {
        Ok(self.state.lock().nodes.get(key).cloned())
    }

    async fn list_nodes(&self, kind: crate::model::NodeKind) -> Result<Vec<Node>> {
        Ok(self
            .state
            .lock()
            .nodes
            .values()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect())
    }

    async fn edges_from(&self, from_key: &str) -> Result<Vec<Edge>> {
        Ok(self
            .state
            .lock()
            .edges
            .iter()
            .filter(|e| e.from_key == from_key)
            .cloned()
            .collect())
    }

    async fn edges_to(&self, to_key: &str) -> Result<Vec<Edge>> {
        Ok(self
            .state
            .lock()
            .edges
            .iter()
            .filter(|e| e.to_key == to_key)
            .cloned()
            .collect())
    }

    async fn delete_edge(&self, edge: &Edge) -> Result<()> {
        let mut state = self.state.lock();
        state.edges.retain(|e| {
            !(e.kind == edge.kind && e.from_key == edge.from_key && e.to_key == edge.to_key)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeKind, Identity, NodeKind};

    fn file_node(path: &str) -> Node {
        Node::new(NodeKind::File, Identity::path(path))
    }

    #[tokio::test]
    async fn test_execute_inserts_new_node() {
        let store = InMemoryGraphStore::new();
        store
            .execute(Write::Node(file_node("a.py")), Mode::Write, 1)
            .await
            .unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_twice_is_idempotent() {
        let store = InMemoryGraphStore::new();
        store
            .execute(Write::Node(file_node("a.py")), Mode::Write, 1)
            .await
            .unwrap();
        store
            .execute(Write::Node(file_node("a.py")), Mode::Write, 1)
            .await
            .unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_edge_is_noop() {
        let store = InMemoryGraphStore::new();
        let edge = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/a.py");
        store.execute(Write::Edge(edge.clone()), Mode::Write, 1).await.unwrap();
        store.execute(Write::Edge(edge), Mode::Write, 1).await.unwrap();
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_session_rollback_discards_writes() {
        let store = InMemoryGraphStore::new();
        let mut session = store.session().await.unwrap();
        session.write(Write::Node(file_node("a.py"))).await.unwrap();
        session.rollback().await.unwrap();
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn test_session_commit_applies_writes() {
        let store = InMemoryGraphStore::new();
        let mut session = store.session().await.unwrap();
        session.write(Write::Node(file_node("a.py"))).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_semantic_search_filters_by_label_and_orders() {
        let store = InMemoryGraphStore::new();
        let a = Node::new(NodeKind::Summary, Identity::path("a"))
            .with_embedding(vec![1.0, 0.0]);
        let b = Node::new(NodeKind::Summary, Identity::path("b"))
            .with_embedding(vec![0.0, 1.0]);
        let unrelated = file_node("c.py");
        store.execute(Write::Node(a), Mode::Write, 1).await.unwrap();
        store.execute(Write::Node(b), Mode::Write, 1).await.unwrap();
        store.execute(Write::Node(unrelated), Mode::Write, 1).await.unwrap();

        let results = store
            .semantic_search(&[1.0, 0.0], "Summary", 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_get_node_missing_returns_none() {
        let store = InMemoryGraphStore::new();
        assert!(store.get_node("File:path:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_nodes_filters_by_kind() {
        let store = InMemoryGraphStore::new();
        store.execute(Write::Node(file_node("a.py")), Mode::Write, 1).await.unwrap();
        store
            .execute(
                Write::Node(Node::new(NodeKind::Directory, Identity::path("d"))),
                Mode::Write,
                1,
            )
            .await
            .unwrap();
        let files = store.list_nodes(NodeKind::File).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_edges_from_and_to() {
        let store = InMemoryGraphStore::new();
        let edge = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/a.py");
        store.execute(Write::Edge(edge.clone()), Mode::Write, 1).await.unwrap();
        assert_eq!(store.edges_from("Directory:path:d").await.unwrap().len(), 1);
        assert_eq!(store.edges_to("File:path:d/a.py").await.unwrap().len(), 1);
        assert!(store.edges_from("File:path:d/a.py").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_edge_removes_only_matching() {
        let store = InMemoryGraphStore::new();
        let kept = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/a.py");
        let removed = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/b.py");
        store.execute(Write::Edge(kept.clone()), Mode::Write, 1).await.unwrap();
        store.execute(Write::Edge(removed.clone()), Mode::Write, 1).await.unwrap();
        store.delete_edge(&removed).await.unwrap();
        let remaining = store.edges_from("Directory:path:d").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].to_key, "File:path:d/a.py");
    }
}
