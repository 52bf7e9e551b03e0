//! Workflow definition types (§3)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceRequirement;

pub type Variables = HashMap<String, serde_json::Value>;

/// A step's executable body. User-provided callables are modeled as trait
/// objects rather than function pointers so both local closures and
/// task-submitting adapters (`TaskStepExecutor`, §4.6 "submit as a task
/// through C5") implement the same interface.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, variables: &Variables) -> std::result::Result<serde_json::Value, String>;
}

#[async_trait]
pub trait StepRollback: Send + Sync {
    async fn rollback(&self, variables: &Variables) -> std::result::Result<(), String>;
}

#[async_trait]
pub trait StepErrorHandler: Send + Sync {
    async fn handle(&self, error: &str, variables: &Variables);
}

/// `condition(variables) -> bool`; absent means "always run".
pub trait StepCondition: Send + Sync {
    fn evaluate(&self, variables: &Variables) -> bool;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// `min(maxDelay, 1000 * backoffMultiplier^(attempts-1))` (§4.6).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let computed = 1000f64 * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(computed.min(self.max_delay_ms as f64).max(0.0) as u64)
    }
}

/// A single DAG node.
pub struct Step {
    pub id: String,
    pub execute: Arc<dyn StepExecutor>,
    pub rollback: Option<Arc<dyn StepRollback>>,
    pub dependencies: Vec<String>,
    pub retry_policy: Option<RetryPolicy>,
    pub condition: Option<Arc<dyn StepCondition>>,
    pub output_variable: Option<String>,
    pub continue_on_error: bool,
    pub resource_requirement: Option<ResourceRequirement>,
    pub error_handler: Option<Arc<dyn StepErrorHandler>>,
    pub priority: u32,
}

impl Step {
    pub fn builder(id: impl Into<String>, execute: Arc<dyn StepExecutor>) -> StepBuilder {
        StepBuilder {
            id: id.into(),
            execute,
            rollback: None,
            dependencies: Vec::new(),
            retry_policy: None,
            condition: None,
            output_variable: None,
            continue_on_error: false,
            resource_requirement: None,
            error_handler: None,
            priority: 0,
        }
    }
}

pub struct StepBuilder {
    id: String,
    execute: Arc<dyn StepExecutor>,
    rollback: Option<Arc<dyn StepRollback>>,
    dependencies: Vec<String>,
    retry_policy: Option<RetryPolicy>,
    condition: Option<Arc<dyn StepCondition>>,
    output_variable: Option<String>,
    continue_on_error: bool,
    resource_requirement: Option<ResourceRequirement>,
    error_handler: Option<Arc<dyn StepErrorHandler>>,
    priority: u32,
}

impl StepBuilder {
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn rollback(mut self, rollback: Arc<dyn StepRollback>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn condition(mut self, condition: Arc<dyn StepCondition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable = Some(name.into());
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn resource_requirement(mut self, req: ResourceRequirement) -> Self {
        self.resource_requirement = Some(req);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn StepErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Step {
        Step {
            id: self.id,
            execute: self.execute,
            rollback: self.rollback,
            dependencies: self.dependencies,
            retry_policy: self.retry_policy,
            condition: self.condition,
            output_variable: self.output_variable,
            continue_on_error: self.continue_on_error,
            resource_requirement: self.resource_requirement,
            error_handler: self.error_handler,
            priority: self.priority,
        }
    }
}

/// `{name, version, steps[], maxConcurrentSteps, rollbackOnError,
/// rollbackOnCancel, continueOnError, resourceLimits}` (§3).
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub steps: Vec<Step>,
    pub max_concurrent_steps: usize,
    pub rollback_on_error: bool,
    pub rollback_on_cancel: bool,
    pub continue_on_error: bool,
    pub variables: Variables,
    pub timeout: Option<Duration>,
}

impl WorkflowDefinition {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Priority for admission/critical-resource reaction purposes (§4.6,
/// §9 "pause all RUNNING workflows with priority < CRITICAL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub variables: Variables,
    pub priority: Priority,
}
