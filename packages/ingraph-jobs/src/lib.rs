//! Job State Store (spec §4.3): durable per-job records (status, step
//! progress, retries, cancellation flag) plus a best-effort pub/sub channel
//! of progress events.

pub mod error;
pub mod memory;
pub mod model;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

pub use error::{JobsError, Result};
pub use memory::InMemoryJobStore;
pub use model::{
    Job, JobAggregateState, JobFilter, Page, ProgressEvent, StepDescriptor, StepRecord, StepState,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, Transition};
