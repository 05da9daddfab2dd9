use super::ExecutionType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Upper bound for a single command or step timeout (one day).
pub const MAX_STEP_TIMEOUT_SECS: u64 = 60 * 60 * 24;

/// A Command or Playbook frozen with its variables, ready to dispatch.
///
/// Steps still carry `{{ target.* }}` references; those are filled in per
/// target at dispatch time. Everything else was substituted once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedUnit {
    pub execution_type: ExecutionType,
    pub unit_id: String,
    pub unit_name: String,
    pub steps: Vec<ResolvedStep>,
    pub variables: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedStep {
    pub name: String,
    pub command: String,
    pub timeout_secs: u64,
}

impl ResolvedUnit {
    /// Worst-case wall time for one target running every step. Saturates
    /// instead of wrapping.
    pub fn total_timeout_secs(&self) -> u64 {
        self.steps
            .iter()
            .fold(0u64, |total, step| total.saturating_add(step.timeout_secs))
    }
}
