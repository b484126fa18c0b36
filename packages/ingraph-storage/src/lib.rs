//! Graph Store Access Layer.
//!
//! A backend-agnostic `GraphStore` port over a property-graph model (`Node`,
//! `Edge`), with a SQLite reference adapter and an in-memory test double.
//! Writes are always merge-by-identity; callers never emit a raw create for
//! an entity node.

pub mod error;
pub mod infrastructure;
pub mod model;
pub mod pool;
pub mod store;

pub use error::{Result, StorageError};
pub use infrastructure::InMemoryGraphStore;
#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteGraphStore;
pub use model::{Edge, EdgeKind, Embedding, Identity, Node, NodeKind, ScoredNode};
pub use pool::{CandidateChain, RetryConfig};
pub use store::{cosine_similarity, rank_by_similarity, GraphStore, Mode, Session, Write};
