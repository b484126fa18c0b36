//! SQLite adapter for `GraphStore` — the reference backend. Stands in for a
//! real property-graph service: the candidate chain is an ordered list of
//! SQLite file paths/aliases, and `semantic_search` always falls back to
//! in-process cosine ranking since SQLite has no native vector operator.

mod schema;

use crate::error::{Result, StorageError};
use crate::model::{Edge, Node, NodeKind, ScoredNode};
use crate::pool::{CandidateChain, RetryConfig};
use crate::store::{rank_by_similarity, GraphStore, Mode, Session, Write};
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument};

/// Whether the native-vector-operator probe has run and what it found.
/// SQLite never has one; this mirrors the caching rule so a real backend
/// (swapped in later) only pays the probe cost once (spec §4.1).
#[derive(Debug)]
struct VectorCapability {
    probed: AtomicBool,
    native_available: AtomicBool,
}

impl VectorCapability {
    fn unprobed() -> Self {
        Self {
            probed: AtomicBool::new(false),
            native_available: AtomicBool::new(false),
        }
    }
}

/// The reference `GraphStore` backend, backed by SQLite via `rusqlite`.
pub struct SqliteGraphStore {
    conn: Arc<Mutex<Connection>>,
    resolved_path: String,
    vector_capability: VectorCapability,
}

impl SqliteGraphStore {
    /// Opens against the first reachable candidate in `chain`, retrying each
    /// per `retry` before falling through (spec §4.1 connection policy).
    pub async fn connect(chain: &CandidateChain, retry: &RetryConfig) -> Result<Self> {
        let (conn, resolved) = chain
            .connect(retry, |candidate| async move {
                open_candidate(&candidate)
            })
            .await?;
        info!(backend = %resolved, "graph store connected");
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            resolved_path: resolved,
            vector_capability: VectorCapability::unprobed(),
        };
        Ok(store)
    }

    /// Convenience constructor for a single-candidate, no-fallback SQLite
    /// file or `:memory:` database.
    pub async fn open(path: impl Into<String>) -> Result<Self> {
        let chain = CandidateChain::single(path);
        Self::connect(&chain, &RetryConfig::default()).await
    }

    pub fn resolved_path(&self) -> &str {
        &self.resolved_path
    }

    fn apply_write(conn: &Connection, write: &Write) -> Result<()> {
        match write {
            Write::Node(node) => upsert_node(conn, node),
            Write::Edge(edge) => upsert_edge(conn, edge),
        }
    }

    fn ping(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch("SELECT 1")
            .map_err(StorageError::from)
    }
}

fn open_candidate(path: &str) -> Result<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()
    } else {
        Connection::open(path)
    }
    .map_err(|e| StorageError::connection(format!("failed to open {path}")).with_source(e))?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(StorageError::from)?;
    Ok(conn)
}

fn upsert_node(conn: &Connection, node: &Node) -> Result<()> {
    let key = node.key();
    let identity = serde_json::to_string(&node.identity)?;
    let properties = serde_json::to_string(&node.properties)?;
    let embedding = node
        .embedding
        .as_ref()
        .map(|v| bincode::serialize(v))
        .transpose()
        .map_err(|e| StorageError::serialization(format!("embedding encode failed: {e}")))?;

    // Merge-by-identity: a conflict on the uniqueness constraint augments
    // the existing row rather than erroring (spec §4.1 idempotency clause).
    conn.execute(
        "INSERT INTO nodes (key, kind, identity, properties, embedding, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(key) DO UPDATE SET
            properties = json_patch(nodes.properties, excluded.properties),
            embedding = COALESCE(excluded.embedding, nodes.embedding),
            updated_at = excluded.updated_at",
        params![
            key,
            node.kind.as_str(),
            identity,
            properties,
            embedding,
            node.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn upsert_edge(conn: &Connection, edge: &Edge) -> Result<()> {
    let properties = serde_json::to_string(&edge.properties)?;
    conn.execute(
        "INSERT INTO edges (kind, from_key, to_key, properties)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(kind, from_key, to_key) DO NOTHING",
        params![edge.kind.as_str(), edge.from_key, edge.to_key, properties],
    )?;
    Ok(())
}

struct NodeRow {
    kind: String,
    identity: String,
    properties: String,
    embedding: Option<Vec<u8>>,
    created_at: String,
    updated_at: Option<String>,
}

fn row_to_node(row: NodeRow) -> Result<Node> {
    let node_kind = parse_kind(&row.kind)?;
    let identity: crate::model::Identity = serde_json::from_str(&row.identity)?;
    let properties: std::collections::BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&row.properties)?;
    let embedding = row
        .embedding
        .map(|bytes| {
            bincode::deserialize::<Vec<f32>>(&bytes)
                .map_err(|e| StorageError::serialization(format!("embedding decode failed: {e}")))
        })
        .transpose()?;
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .map_err(|e| StorageError::serialization(format!("created_at decode failed: {e}")))?
        .with_timezone(&chrono::Utc);
    let updated_at = row
        .updated_at
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| StorageError::serialization(format!("updated_at decode failed: {e}")))
        })
        .transpose()?;
    Ok(Node {
        kind: node_kind,
        identity,
        created_at,
        updated_at,
        embedding,
        properties,
    })
}

fn parse_kind(kind: &str) -> Result<NodeKind> {
    match kind {
        "Repository" => Ok(NodeKind::Repository),
        "Directory" => Ok(NodeKind::Directory),
        "File" => Ok(NodeKind::File),
        "Module" => Ok(NodeKind::Module),
        "Class" => Ok(NodeKind::Class),
        "Function" => Ok(NodeKind::Function),
        "Summary" => Ok(NodeKind::Summary),
        "Documentation" => Ok(NodeKind::Documentation),
        other => Err(StorageError::query(format!("unknown node kind: {other}"))),
    }
}

struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    pending: Vec<Write>,
}

#[async_trait]
impl Session for SqliteSession {
    async fn write(&mut self, write: Write) -> Result<()> {
        self.pending.push(write);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN")?;
        for write in &self.pending {
            if let Err(err) = SqliteGraphStore::apply_write(&conn, write) {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err);
            }
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    #[instrument(skip(self))]
    async fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(schema::DDL)?;
        Ok(())
    }

    async fn execute(&self, write: Write, _mode: Mode, retry: u32) -> Result<()> {
        let attempts = retry.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            let conn = self.conn.lock();
            match Self::apply_write(&conn, &write) {
                Ok(()) => return Ok(()),
                Err(err) if err.retryable && attempt + 1 < attempts => {
                    drop(conn);
                    last_err = Some(err);
                    tokio::time::sleep(std::time::Duration::from_millis(50 * (attempt as u64 + 1)))
                        .await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StorageError::query("write failed with no attempts")))
    }

    async fn execute_batch(&self, writes: Vec<Write>, _mode: Mode) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN")?;
        for write in &writes {
            if let Err(err) = Self::apply_write(&conn, write) {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err);
            }
        }
        conn.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn session(&self) -> Result<Box<dyn Session>> {
        Ok(Box::new(SqliteSession {
            conn: self.conn.clone(),
            pending: Vec::new(),
        }))
    }

    #[instrument(skip(self, embedding))]
    async fn semantic_search(
        &self,
        embedding: &[f32],
        label: &str,
        limit: usize,
    ) -> Result<Vec<ScoredNode>> {
        // SQLite never exposes a native cosine operator; the probe always
        // resolves to "unavailable" and is cached so repeated calls skip it.
        if !self.vector_capability.probed.swap(true, Ordering::SeqCst) {
            self.vector_capability
                .native_available
                .store(false, Ordering::SeqCst);
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, identity, properties, embedding, created_at, updated_at
             FROM nodes WHERE kind = ?1 AND embedding IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![label], node_row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(row_to_node(row)?);
        }
        Ok(rank_by_similarity(embedding, candidates, limit))
    }

    async fn get_node(&self, key: &str) -> Result<Option<Node>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT kind, identity, properties, embedding, created_at, updated_at
                 FROM nodes WHERE key = ?1",
                params![key],
                node_row_from_sql,
            )
            .optional()?;
        drop(conn);
        row.map(row_to_node).transpose()
    }

    #[instrument(skip(self))]
    async fn list_nodes(&self, kind: NodeKind) -> Result<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, identity, properties, embedding, created_at, updated_at
             FROM nodes WHERE kind = ?1",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str()], node_row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(row_to_node).collect()
    }

    async fn edges_from(&self, from_key: &str) -> Result<Vec<Edge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, from_key, to_key, properties FROM edges WHERE from_key = ?1",
        )?;
        let rows = stmt
            .query_map(params![from_key], edge_row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().collect()
    }

    async fn edges_to(&self, to_key: &str) -> Result<Vec<Edge>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT kind, from_key, to_key, properties FROM edges WHERE to_key = ?1")?;
        let rows = stmt
            .query_map(params![to_key], edge_row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().collect()
    }

    async fn delete_edge(&self, edge: &Edge) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM edges WHERE kind = ?1 AND from_key = ?2 AND to_key = ?3",
            params![edge.kind.as_str(), edge.from_key, edge.to_key],
        )?;
        Ok(())
    }
}

fn node_row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        kind: row.get(0)?,
        identity: row.get(1)?,
        properties: row.get(2)?,
        embedding: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn edge_row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<Result<Edge>> {
    let kind: String = row.get(0)?;
    let from_key: String = row.get(1)?;
    let to_key: String = row.get(2)?;
    let properties: String = row.get(3)?;
    Ok((|| -> Result<Edge> {
        let properties: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&properties)?;
        Ok(Edge {
            kind: parse_edge_kind(&kind)?,
            from_key,
            to_key,
            properties,
        })
    })())
}

fn parse_edge_kind(kind: &str) -> Result<crate::model::EdgeKind> {
    use crate::model::EdgeKind;
    match kind {
        "CONTAINS" => Ok(EdgeKind::Contains),
        "IMPORTS" => Ok(EdgeKind::Imports),
        "CALLS" => Ok(EdgeKind::Calls),
        "INHERITS_FROM" => Ok(EdgeKind::InheritsFrom),
        "DOCUMENTED_BY" => Ok(EdgeKind::DocumentedBy),
        "SUMMARIZED_BY" => Ok(EdgeKind::SummarizedBy),
        "IMPLEMENTS" => Ok(EdgeKind::Implements),
        "DEFINES" => Ok(EdgeKind::Defines),
        other => Err(StorageError::query(format!("unknown edge kind: {other}"))),
    }
}

impl SqliteGraphStore {
    /// Validates the pooled connection is alive; used before handing a
    /// connection back out of an idle pool (spec §4.1 "idle connections are
    /// pinged before reuse"). A single-connection adapter pings itself.
    pub fn validate(&self) -> Result<()> {
        self.ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EdgeKind, Identity};

    async fn store() -> SqliteGraphStore {
        let store = SqliteGraphStore::open(":memory:").await.unwrap();
        store.initialize_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_initialize_schema_is_idempotent() {
        let store = store().await;
        store.initialize_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_node_then_get() {
        let store = store().await;
        let node = Node::new(NodeKind::File, Identity::path("a.py"));
        let key = node.key();
        store.execute(Write::Node(node), Mode::Write, 1).await.unwrap();
        let fetched = store.get_node(&key).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_node_write_is_augmenting_noop() {
        let store = store().await;
        let node = Node::new(NodeKind::File, Identity::path("a.py"))
            .with_property("size", serde_json::json!(10));
        let key = node.key();
        store.execute(Write::Node(node), Mode::Write, 1).await.unwrap();

        let node2 = Node::new(NodeKind::File, Identity::path("a.py"))
            .with_property("lang", serde_json::json!("python"));
        store.execute(Write::Node(node2), Mode::Write, 1).await.unwrap();

        let fetched = store.get_node(&key).await.unwrap().unwrap();
        assert_eq!(fetched.properties.get("size"), Some(&serde_json::json!(10)));
        assert_eq!(
            fetched.properties.get("lang"),
            Some(&serde_json::json!("python"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_edge_is_noop() {
        let store = store().await;
        let edge = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/a.py");
        store.execute(Write::Edge(edge.clone()), Mode::Write, 1).await.unwrap();
        store.execute(Write::Edge(edge), Mode::Write, 1).await.unwrap();
        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_semantic_search_ranks_by_cosine_similarity() {
        let store = store().await;
        let a = Node::new(NodeKind::Summary, Identity::path("a")).with_embedding(vec![1.0, 0.0]);
        let b = Node::new(NodeKind::Summary, Identity::path("b")).with_embedding(vec![0.0, 1.0]);
        store.execute(Write::Node(a), Mode::Write, 1).await.unwrap();
        store.execute(Write::Node(b), Mode::Write, 1).await.unwrap();

        let results = store
            .semantic_search(&[1.0, 0.0], "Summary", 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_session_commit_persists_all_writes() {
        let store = store().await;
        let mut session = store.session().await.unwrap();
        session
            .write(Write::Node(Node::new(NodeKind::File, Identity::path("a.py"))))
            .await
            .unwrap();
        session
            .write(Write::Node(Node::new(NodeKind::File, Identity::path("b.py"))))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_batch_commits_all_writes_as_one_unit() {
        let store = store().await;
        let writes = vec![
            Write::Node(Node::new(NodeKind::File, Identity::path("a.py"))),
            Write::Node(Node::new(NodeKind::File, Identity::path("b.py"))),
            Write::Edge(Edge::new(
                EdgeKind::Imports,
                "File:path:a.py",
                "File:path:b.py",
            )),
        ];
        store.execute_batch(writes, Mode::Write).await.unwrap();

        let conn = store.conn.lock();
        let nodes: i64 = conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))
            .unwrap();
        let edges: i64 = conn
            .query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(nodes, 2);
        assert_eq!(edges, 1);
    }

    #[tokio::test]
    async fn test_get_node_round_trips_identity() {
        let store = store().await;
        let node = Node::new(NodeKind::Function, Identity::named("greet", "main.py"));
        store.execute(Write::Node(node), Mode::Write, 1).await.unwrap();
        let fetched = store
            .get_node("Function:name:main.py::greet")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.identity, Identity::named("greet", "main.py"));
    }

    #[tokio::test]
    async fn test_list_nodes_filters_by_kind() {
        let store = store().await;
        store
            .execute(Write::Node(Node::new(NodeKind::File, Identity::path("a.py"))), Mode::Write, 1)
            .await
            .unwrap();
        store
            .execute(Write::Node(Node::new(NodeKind::Directory, Identity::path("d"))), Mode::Write, 1)
            .await
            .unwrap();
        let files = store.list_nodes(NodeKind::File).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].identity, Identity::path("a.py"));
    }

    #[tokio::test]
    async fn test_edges_from_and_to() {
        let store = store().await;
        let edge = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/a.py");
        store.execute(Write::Edge(edge), Mode::Write, 1).await.unwrap();
        assert_eq!(store.edges_from("Directory:path:d").await.unwrap().len(), 1);
        assert_eq!(store.edges_to("File:path:d/a.py").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_edge_removes_only_matching() {
        let store = store().await;
        let kept = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/a.py");
        let removed = Edge::new(EdgeKind::Contains, "Directory:path:d", "File:path:d/b.py");
        store.execute(Write::Edge(kept), Mode::Write, 1).await.unwrap();
        store.execute(Write::Edge(removed.clone()), Mode::Write, 1).await.unwrap();
        store.delete_edge(&removed).await.unwrap();
        let remaining = store.edges_from("Directory:path:d").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
