//! Wire/file format for workflow definitions (§6 ambient CLI addition).
//!
//! A [`WorkflowDefinition`] holds `Arc<dyn StepExecutor>` trait objects and
//! can't be deserialized directly. [`WorkflowSpec`] is the serializable
//! subset a YAML/JSON file (or an HTTP POST body) can carry: every step
//! names a `method` that gets dispatched through the orchestrator as a
//! task rather than run as an in-process callable, the way
//! `axon::orchestration::workflow`'s step descriptors reference worker
//! capabilities by name instead of embedding a closure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MemoryTiers;
use crate::orchestrator::task::resource_requirement_for_method;

use super::definition::{RetryPolicy, Step, StepExecutor, Variables, WorkflowDefinition};

fn default_version() -> String {
    "1".to_string()
}

fn default_max_concurrent_steps() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// File/wire shape accepted by `loomd submit-workflow` and `POST /workflows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepSpec>,
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    #[serde(default)]
    pub rollback_on_error: bool,
    #[serde(default)]
    pub rollback_on_cancel: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Every step built from a [`WorkflowSpec`] carries a resource requirement,
/// so [`execute`](StepExecutor::execute) is never reached in practice — the
/// engine dispatches through the orchestrator instead. This exists only as
/// a safety net against a future change that strips the requirement.
struct RemoteStep {
    method: String,
}

#[async_trait]
impl StepExecutor for RemoteStep {
    async fn execute(&self, _variables: &Variables) -> Result<serde_json::Value, String> {
        Err(format!(
            "step for method {} was expected to dispatch through the orchestrator",
            self.method
        ))
    }
}

impl WorkflowSpec {
    pub fn into_definition(self, memory_tiers: &MemoryTiers) -> WorkflowDefinition {
        let steps = self
            .steps
            .into_iter()
            .map(|spec| {
                let resource_requirement = resource_requirement_for_method(&spec.method, memory_tiers);
                let mut builder = Step::builder(spec.id, Arc::new(RemoteStep { method: spec.method }))
                    .depends_on(spec.depends_on)
                    .resource_requirement(resource_requirement)
                    .continue_on_error(spec.continue_on_error);
                if let Some(output_variable) = spec.output_variable {
                    builder = builder.output_variable(output_variable);
                }
                if let Some(retry) = spec.retry {
                    builder = builder.retry_policy(RetryPolicy {
                        max_attempts: retry.max_attempts,
                        backoff_multiplier: retry.backoff_multiplier,
                        max_delay_ms: retry.max_delay_ms,
                    });
                }
                builder.build()
            })
            .collect();

        WorkflowDefinition {
            id: self.id,
            name: self.name,
            version: self.version,
            steps,
            max_concurrent_steps: self.max_concurrent_steps,
            rollback_on_error: self.rollback_on_error,
            rollback_on_cancel: self.rollback_on_cancel,
            continue_on_error: self.continue_on_error,
            variables: self.variables,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_definition_derives_resource_requirement_from_method() {
        let spec = WorkflowSpec {
            id: "wf1".to_string(),
            name: "demo".to_string(),
            version: default_version(),
            steps: vec![StepSpec {
                id: "step1".to_string(),
                method: "videoProcessing".to_string(),
                depends_on: vec![],
                retry: None,
                output_variable: None,
                continue_on_error: false,
            }],
            max_concurrent_steps: default_max_concurrent_steps(),
            rollback_on_error: false,
            rollback_on_cancel: false,
            continue_on_error: false,
            variables: Default::default(),
            timeout_ms: None,
        };
        let tiers = MemoryTiers::default();
        let definition = spec.into_definition(&tiers);
        let step = definition.step("step1").unwrap();
        assert_eq!(step.resource_requirement.unwrap().memory_bytes, tiers.large_bytes);
    }
}
