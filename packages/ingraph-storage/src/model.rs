//! Graph data model: polymorphic nodes and typed edges (spec §3).
//!
//! Every node carries an identifying property unique within its kind; graph
//! writes are always merge-by-identity (never blind insert) so re-running a
//! step over unchanged input reproduces the same node/edge set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dense embedding vector. Fixed dimension within a given deployment.
pub type Embedding = Vec<f32>;

/// Node kind discriminant. `identity()` below is the uniqueness-constrained
/// property per kind (spec §3: "For each node type, identifying property is
/// unique").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Repository,
    Directory,
    File,
    Module,
    Class,
    Function,
    Summary,
    Documentation,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Repository => "Repository",
            NodeKind::Directory => "Directory",
            NodeKind::File => "File",
            NodeKind::Module => "Module",
            NodeKind::Class => "Class",
            NodeKind::Function => "Function",
            NodeKind::Summary => "Summary",
            NodeKind::Documentation => "Documentation",
        }
    }

    /// Whether nodes of this kind may carry an embedding (spec §3: "optional
    /// embedding ... for `Summary` and `Documentation`").
    pub fn carries_embedding(&self) -> bool {
        matches!(self, NodeKind::Summary | NodeKind::Documentation)
    }
}

/// A node's identifying property: either a path (filesystem-rooted kinds) or
/// a composite `name + container` (symbol kinds). Summary/Documentation
/// nodes are identified by the identity of their target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    Path(String),
    NameInContainer { name: String, container: String },
}

impl Identity {
    pub fn path(p: impl Into<String>) -> Self {
        Identity::Path(p.into())
    }

    pub fn named(name: impl Into<String>, container: impl Into<String>) -> Self {
        Identity::NameInContainer {
            name: name.into(),
            container: container.into(),
        }
    }

    /// Stable string form used as the merge key and, for the SQLite adapter,
    /// the uniqueness-constrained column value.
    pub fn key(&self) -> String {
        match self {
            Identity::Path(p) => format!("path:{p}"),
            Identity::NameInContainer { name, container } => {
                format!("name:{container}::{name}")
            }
        }
    }
}

/// A graph node (spec §3). Arbitrary non-identifying properties live in
/// `properties`; callers augment them without touching identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub embedding: Option<Embedding>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Node {
    pub fn new(kind: NodeKind, identity: Identity) -> Self {
        Self {
            kind,
            identity,
            created_at: Utc::now(),
            updated_at: None,
            embedding: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// The identity key used for merge-by-identity writes and as the node's
    /// handle in edges.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.identity.key())
    }
}

/// Edge kind discriminant (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Contains,
    Imports,
    Calls,
    InheritsFrom,
    DocumentedBy,
    SummarizedBy,
    Implements,
    Defines,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::Imports => "IMPORTS",
            EdgeKind::Calls => "CALLS",
            EdgeKind::InheritsFrom => "INHERITS_FROM",
            EdgeKind::DocumentedBy => "DOCUMENTED_BY",
            EdgeKind::SummarizedBy => "SUMMARIZED_BY",
            EdgeKind::Implements => "IMPLEMENTS",
            EdgeKind::Defines => "DEFINES",
        }
    }
}

/// A directed edge between two nodes, addressed by their identity keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub kind: EdgeKind,
    pub from_key: String,
    pub to_key: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Edge {
    pub fn new(kind: EdgeKind, from_key: impl Into<String>, to_key: impl Into<String>) -> Self {
        Self {
            kind,
            from_key: from_key.into(),
            to_key: to_key.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// A `semantic_search` hit: the node and its cosine similarity to the query
/// embedding, descending order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}
