//! Pipeline Orchestrator and Step Registry & Contract (spec §4.4, §4.5,
//! §4.6): loads an ordered step list from configuration, dispatches each
//! step to the Worker Runtime, aggregates status, and applies retry policy.

pub mod contract;
pub mod error;
pub mod ordering;
pub mod orchestrator;
pub mod registry;
pub mod worker;

pub use contract::{Step, StepOptions, StepStatus};
pub use error::{ErrorKind, PipelineError, Result, StepError};
pub use orchestrator::{Orchestrator, PipelineConfig};
pub use ordering::validate_order;
pub use registry::StepRegistry;
pub use worker::{StepQueue, Task};
