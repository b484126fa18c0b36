//! Step Registry (spec §4.4): a process-local lookup from configured step
//! name to implementation, populated once at startup by the daemon binary.

use crate::contract::Step;
use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered steps, keyed by `Step::name()`. Registration happens once at
/// process start; lookups afterward never mutate the map, so a plain
/// `HashMap` behind an `Arc` is sufficient (no runtime re-registration).
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
        }
    }

    /// Registers a step under its own `name()`. Panics on duplicate
    /// registration: this is a programming error in the daemon's wiring,
    /// not a runtime condition callers should handle.
    pub fn register(&mut self, step: Arc<dyn Step>) {
        let name = step.name().to_string();
        if self.steps.insert(name.clone(), step).is_some() {
            panic!("step '{name}' registered twice");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }
}
