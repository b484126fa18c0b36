//! Dependency validation for a configured step order (spec §4.5, §8
//! scenario 6): the orchestrator runs steps strictly in the order given by
//! configuration, so the only thing to validate up front is that every
//! step's declared dependencies already appear earlier in that same list.
//! There is no implicit reordering and no DAG to schedule here — that
//! belongs to the Summarizer's internal fan-out, not to the orchestrator.

use crate::contract::Step;
use crate::error::{PipelineError, Result};
use crate::registry::StepRegistry;
use std::collections::HashSet;

/// Resolves `names` against `registry` and checks that every step's
/// dependencies are satisfied earlier in the list. Returns the resolved
/// steps in configured order, ready for sequential execution.
pub fn validate_order(
    registry: &StepRegistry,
    names: &[String],
) -> Result<Vec<std::sync::Arc<dyn Step>>> {
    let mut satisfied: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::with_capacity(names.len());

    for name in names {
        let step = registry.get(name)?;
        for dependency in step.dependencies() {
            if !satisfied.contains(dependency.as_str()) {
                return Err(PipelineError::UnsatisfiedDependency {
                    step: name.clone(),
                    dependency,
                });
            }
        }
        satisfied.insert(name.as_str());
        ordered.push(step);
    }

    Ok(ordered)
}
