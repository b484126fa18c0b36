//! DAG construction for the Summarizer (spec §4.9 "DAG construction").
//! Grounded on the teacher's `dependency_graph.rs` reverse-index idiom and
//! `stage_dag.rs`'s `petgraph` usage, generalized from a fixed, small set of
//! pipeline stages to an arbitrary graph of code entities queried at
//! runtime.
//!
//! Edge direction follows spec §4.9: "child -> parent (containment), callee
//! -> caller, inheritance target -> subclass" — i.e. an edge `a -> b` means
//! "a must be summarized before b". Cycles are broken by collapsing each
//! strongly connected component into a single super-node, summarized in one
//! LLM call over the combined content of its members.

use ingraph_storage::{EdgeKind, GraphStore, Node, NodeKind};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// One unit of summarization work: either a single code entity or a
/// collapsed strongly-connected-component of mutually dependent entities
/// (spec §4.9 "cycles ... collapsed into a single super-node").
#[derive(Debug, Clone)]
pub struct SummaryUnit {
    pub members: Vec<Node>,
}

impl SummaryUnit {
    pub fn is_scc(&self) -> bool {
        self.members.len() > 1
    }

    /// Stable identity for this unit: the sole member's key, or a
    /// deterministic composite for a collapsed SCC (sorted so the same set
    /// of members always yields the same key across runs).
    pub fn unit_key(&self) -> String {
        if self.members.len() == 1 {
            return self.members[0].key();
        }
        let mut keys: Vec<String> = self.members.iter().map(Node::key).collect();
        keys.sort();
        format!("scc:{}", keys.join(","))
    }
}

/// The Summarizer's in-memory dependency DAG: acyclic, with a unique top
/// node (the repository), owned by the single job run that built it (spec
/// §3 "Ownership").
pub struct DependencyDag {
    graph: DiGraph<SummaryUnit, ()>,
    index_by_key: HashMap<String, NodeIndex>,
}

impl DependencyDag {
    pub fn units(&self) -> impl Iterator<Item = (NodeIndex, &SummaryUnit)> {
        self.graph.node_indices().map(|idx| (idx, &self.graph[idx]))
    }

    pub fn unit(&self, idx: NodeIndex) -> &SummaryUnit {
        &self.graph[idx]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Predecessors of `idx`: units that must be summarized before it.
    pub fn predecessors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .collect()
    }

    /// Successors of `idx`: units waiting on it.
    pub fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .collect()
    }

    pub fn index_of(&self, key: &str) -> Option<NodeIndex> {
        self.index_by_key.get(key).copied()
    }

    /// Units with zero predecessors: the initial ready set (spec §4.9
    /// "Scheduling" — "ready set = nodes whose all predecessors are
    /// summarized").
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&idx| self.predecessors(idx).is_empty())
            .collect()
    }
}

/// Queries the graph store for all code entities and the containment/call/
/// inheritance edges between them, then builds the dependency DAG,
/// collapsing any cycle into a single `SummaryUnit` via Tarjan's SCC
/// algorithm (spec §4.9, §9 "Cyclic dependencies ... standard
/// strongly-connected-component collapse").
pub async fn build_dag(store: &Arc<dyn GraphStore>) -> ingraph_storage::Result<DependencyDag> {
    let mut raw = DiGraph::<Node, ()>::new();
    let mut raw_index: HashMap<String, NodeIndex> = HashMap::new();

    for kind in [
        NodeKind::Repository,
        NodeKind::Directory,
        NodeKind::File,
        NodeKind::Module,
        NodeKind::Class,
        NodeKind::Function,
    ] {
        for node in store.list_nodes(kind).await? {
            let key = node.key();
            let idx = raw.add_node(node);
            raw_index.insert(key, idx);
        }
    }

    for (key, &from_idx) in raw_index.clone().iter() {
        for edge in store.edges_from(key).await? {
            let Some(&to_idx) = raw_index.get(&edge.to_key) else {
                continue;
            };
            // "must be summarized first" direction: the contained/called/
            // inherited-from entity is summarized before its container.
            match edge.kind {
                EdgeKind::Contains => {
                    raw.update_edge(to_idx, from_idx, ());
                }
                EdgeKind::Calls => {
                    raw.update_edge(to_idx, from_idx, ());
                }
                EdgeKind::InheritsFrom => {
                    raw.update_edge(from_idx, to_idx, ());
                }
                _ => {}
            }
        }
    }

    Ok(collapse_sccs(raw))
}

/// Collapses every strongly-connected-component of `raw` into one
/// `SummaryUnit` node, producing an acyclic condensation graph. A singleton
/// SCC (the common case: no cycle) becomes a one-member unit.
fn collapse_sccs(raw: DiGraph<Node, ()>) -> DependencyDag {
    let sccs = tarjan_scc(&raw);
    let mut graph = DiGraph::<SummaryUnit, ()>::new();
    let mut owner: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut index_by_key = HashMap::new();

    for scc in &sccs {
        let members: Vec<Node> = scc.iter().map(|&idx| raw[idx].clone()).collect();
        let unit = SummaryUnit { members };
        let unit_key = unit.unit_key();
        let unit_idx = graph.add_node(unit);
        index_by_key.insert(unit_key, unit_idx);
        for &raw_idx in scc {
            owner.insert(raw_idx, unit_idx);
        }
    }

    for edge in raw.raw_edges() {
        let from_unit = owner[&edge.source()];
        let to_unit = owner[&edge.target()];
        if from_unit != to_unit {
            graph.update_edge(from_unit, to_unit, ());
        }
    }

    DependencyDag { graph, index_by_key }
}
