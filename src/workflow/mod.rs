//! Workflow Engine (C6)
//!
//! DAG-based workflow orchestration: compiles a dependency graph, executes
//! runnable steps honoring dependencies, runs rollback on failure, and
//! exposes a pause/resume/cancel lifecycle. Grounded on
//! `axon::orchestration::mod::Orchestrator` + `scheduler.rs`'s topological
//! sort, generalized from "one pass" execution to the continuous
//! dependency-gated scheduling in §4.6.

pub mod dag;
pub mod definition;
pub mod spec;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::events::{Event, EventBus};
use crate::orchestrator::task::TaskSubmission;
use crate::orchestrator::{Orchestrator, ResourceUtilization};
use crate::resource::{AlertLevel, ResourceManager, ResourceRequirement};

use definition::{CreateOptions, Priority, Step, Variables, WorkflowDefinition};
use state::{ResourceUsage, StepState, StepStatus, WorkflowState, WorkflowStatus};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("cycle detected in workflow dependencies")]
    CycleDetected,
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error("maxConcurrentWorkflows reached")]
    TooManyConcurrentWorkflows,
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error(transparent)]
    Resource(#[from] crate::resource::ResourceError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

const SKIPPED_SENTINEL: &str = "__skipped__";

struct Registered {
    definition: Arc<WorkflowDefinition>,
    last_touched: std::sync::Mutex<chrono::DateTime<Utc>>,
}

/// Owns every workflow's state exclusively; callers see copies via
/// [`WorkflowEngine::get_state`].
pub struct WorkflowEngine {
    config: Settings,
    resource_manager: Arc<ResourceManager>,
    events: Arc<EventBus>,
    orchestrator: Arc<Orchestrator>,
    definitions: RwLock<HashMap<String, Registered>>,
    states: RwLock<HashMap<String, WorkflowState>>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkflowEngine {
    pub fn new(
        config: Settings,
        resource_manager: Arc<ResourceManager>,
        events: Arc<EventBus>,
        orchestrator: Arc<Orchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resource_manager,
            events,
            orchestrator,
            definitions: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Validate the DAG (§4.6 compile) without registering it.
    pub fn compile(definition: &WorkflowDefinition) -> Result<Vec<Vec<String>>> {
        dag::compile(definition)
    }

    /// Allocate a workflow id, validate the DAG, and register PENDING state.
    pub async fn create(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        options: CreateOptions,
    ) -> Result<String> {
        dag::compile(&definition)?;

        let active = self
            .states
            .read()
            .await
            .values()
            .filter(|s| !is_terminal(s.status))
            .count();
        if active >= self.config.max_concurrent_workflows {
            return Err(WorkflowError::TooManyConcurrentWorkflows);
        }

        let workflow_id = Uuid::new_v4().to_string();
        let mut variables = definition.variables.clone();
        variables.extend(options.variables);

        let step_states = definition
            .steps
            .iter()
            .map(|s| StepState::pending(s.id.clone()))
            .collect();

        let now = Utc::now();
        let state = WorkflowState {
            id: workflow_id.clone(),
            definition_id: definition.id.clone(),
            status: WorkflowStatus::Pending,
            current_step: 0,
            step_states,
            variables,
            priority: options.priority,
            resource_usage: ResourceUsage {
                current: ResourceUtilization::default(),
                peak: ResourceUtilization::default(),
            },
            created_at: now,
            updated_at: now,
            error: None,
            completion_order: Vec::new(),
        };

        self.definitions.write().await.insert(
            workflow_id.clone(),
            Registered {
                definition: Arc::new(definition),
                last_touched: std::sync::Mutex::new(now),
            },
        );
        self.states.write().await.insert(workflow_id.clone(), state);

        self.events
            .publish(Event::new("workflow:created").with_workflow(workflow_id.clone()));
        info!(workflow_id = %workflow_id, "workflow created");
        Ok(workflow_id)
    }

    /// Estimate aggregate resources, reserve them, transition to RUNNING,
    /// and begin execution (§4.6).
    pub async fn start(self: &Arc<Self>, workflow_id: &str) -> Result<()> {
        let definition = self.definition_of(workflow_id).await?;

        {
            let states = self.states.read().await;
            let state = states
                .get(workflow_id)
                .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
            if state.status != WorkflowStatus::Pending {
                return Err(WorkflowError::PreconditionFailed(format!(
                    "cannot start workflow in {:?}",
                    state.status
                )));
            }
        }

        let memory = definition
            .steps
            .iter()
            .filter_map(|s| s.resource_requirement)
            .map(|r| r.memory_bytes)
            .max()
            .unwrap_or(0);
        let cpu = definition
            .steps
            .iter()
            .filter_map(|s| s.resource_requirement)
            .map(|r| r.cpu_percent)
            .fold(0f32, f32::max);
        let timeout_ms = definition
            .timeout
            .unwrap_or(Duration::from_secs(3600))
            .as_millis() as u64;
        let aggregate = ResourceRequirement::new(memory, cpu, timeout_ms);

        if !self.resource_manager.reserve(workflow_reservation_key(workflow_id), aggregate).await {
            return Err(crate::resource::ResourceError::InsufficientResources(
                "workflow aggregate resource estimate refused".to_string(),
            )
            .into());
        }

        {
            let mut states = self.states.write().await;
            let state = states.get_mut(workflow_id).expect("checked above");
            state.status = WorkflowStatus::Running;
            state.updated_at = Utc::now();
        }
        self.events
            .publish(Event::new("workflow:started").with_workflow(workflow_id.to_string()));

        let this = self.clone();
        let id = workflow_id.to_string();
        let mut tasks = self.tasks.lock().await;
        tasks.spawn(async move {
            this.run(id).await;
        });

        Ok(())
    }

    /// Convenience for the HTTP surface and CLI: build a definition from a
    /// file/wire [`spec::WorkflowSpec`], register it, and start it.
    pub async fn submit(self: &Arc<Self>, workflow_spec: spec::WorkflowSpec, options: CreateOptions) -> Result<String> {
        let definition = workflow_spec.into_definition(&self.config.memory_tiers);
        let workflow_id = self.create(definition, options).await?;
        self.start(&workflow_id).await?;
        Ok(workflow_id)
    }

    async fn definition_of(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        let entry = definitions
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        *entry.last_touched.lock().unwrap() = Utc::now();
        Ok(entry.definition.clone())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    async fn run(self: Arc<Self>, workflow_id: String) {
        let definition = match self.definition_of(&workflow_id).await {
            Ok(d) => d,
            Err(_) => return,
        };

        let mut running: HashSet<String> = HashSet::new();
        // Steps other steps may depend on: only a true completion or a
        // skip satisfies "dependency is COMPLETED" (spec.md:62, the
        // testable property at spec.md:268). A continue-on-error failure
        // is terminal for the loop but must never unblock downstream steps.
        let mut completed: HashSet<String> = HashSet::new();
        // Every step that has finished one way or another, used only to
        // detect quiescence (nothing left runnable, nothing in flight).
        let mut terminal: HashSet<String> = HashSet::new();
        let mut aborted = false;

        loop {
            let status = self.status_of(&workflow_id).await;
            match status {
                Some(WorkflowStatus::Cancelled) => break,
                Some(WorkflowStatus::Paused) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Some(WorkflowStatus::Running) => {}
                _ => break,
            }

            if terminal.len() >= definition.steps.len() && running.is_empty() {
                break;
            }

            let executable: Vec<&Step> = definition
                .steps
                .iter()
                .filter(|s| {
                    !running.contains(&s.id)
                        && !terminal.contains(&s.id)
                        && s.dependencies.iter().all(|d| completed.contains(d))
                })
                .take(definition.max_concurrent_steps.saturating_sub(running.len()))
                .collect();

            if executable.is_empty() && running.is_empty() {
                // nothing runnable and nothing in flight: either everything
                // finished (checked above) or the remaining steps are
                // unreachable because one of their dependencies never
                // completed (e.g. aborted via continue_on_error bookkeeping)
                break;
            }

            let mut joins = Vec::new();
            for step in executable {
                running.insert(step.id.clone());
                let this = self.clone();
                let wf_id = workflow_id.clone();
                let step_id = step.id.clone();
                joins.push(tokio::spawn(async move {
                    let outcome = this.run_step(&wf_id, &step_id).await;
                    (step_id, outcome)
                }));
            }

            for join in joins {
                let (step_id, outcome) = match join.await {
                    Ok(v) => v,
                    Err(err) => {
                        error!(%err, "step task panicked");
                        continue;
                    }
                };
                running.remove(&step_id);
                match outcome {
                    StepOutcome::Completed | StepOutcome::Skipped => {
                        completed.insert(step_id.clone());
                        terminal.insert(step_id);
                    }
                    StepOutcome::FailedContinue => {
                        terminal.insert(step_id);
                    }
                    StepOutcome::Abort => {
                        aborted = true;
                    }
                }
            }

            if aborted {
                break;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if aborted {
            self.abort_path(&workflow_id, &definition).await;
        } else if self.status_of(&workflow_id).await == Some(WorkflowStatus::Running) {
            self.complete(&workflow_id).await;
        }
    }

    async fn status_of(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.states.read().await.get(workflow_id).map(|s| s.status)
    }

    async fn run_step(self: &Arc<Self>, workflow_id: &str, step_id: &str) -> StepOutcome {
        let definition = match self.definition_of(workflow_id).await {
            Ok(d) => d,
            Err(_) => return StepOutcome::Abort,
        };
        let step = definition.step(step_id).expect("step exists");

        let variables = {
            let states = self.states.read().await;
            states
                .get(workflow_id)
                .map(|s| s.variables.clone())
                .unwrap_or_default()
        };

        if let Some(condition) = &step.condition {
            if !condition.evaluate(&variables) {
                self.mark_skipped(workflow_id, step_id).await;
                return StepOutcome::Skipped;
            }
        }

        self.mark_running(workflow_id, step_id).await;
        self.events.publish(
            Event::new("workflow:step:started")
                .with_workflow(workflow_id.to_string())
                .with_step(step_id.to_string()),
        );

        let started = std::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = self.execute_step_body(step, &variables).await;
            match outcome {
                Ok(result) => {
                    self.mark_completed(workflow_id, step, result, started.elapsed(), attempts)
                        .await;
                    return StepOutcome::Completed;
                }
                Err(message) => {
                    if let Some(policy) = step.retry_policy {
                        if attempts < policy.max_attempts {
                            warn!(workflow_id, step_id, attempt = attempts, %message, "retrying step");
                            tokio::time::sleep(policy.delay_for_attempt(attempts)).await;
                            continue;
                        }
                    }

                    if let Some(handler) = &step.error_handler {
                        handler.handle(&message, &variables).await;
                        self.mark_failed(workflow_id, step_id, message, started.elapsed(), attempts)
                            .await;
                        return if step.continue_on_error {
                            StepOutcome::FailedContinue
                        } else {
                            StepOutcome::Abort
                        };
                    }

                    self.mark_failed(workflow_id, step_id, message.clone(), started.elapsed(), attempts)
                        .await;
                    if definition.continue_on_error {
                        return StepOutcome::FailedContinue;
                    }
                    return StepOutcome::Abort;
                }
            }
        }
    }

    async fn execute_step_body(
        &self,
        step: &Step,
        variables: &Variables,
    ) -> std::result::Result<serde_json::Value, String> {
        if let Some(req) = step.resource_requirement {
            let params = serde_json::to_value(variables).unwrap_or(serde_json::Value::Null);
            let task_id = self
                .orchestrator
                .submit_task(TaskSubmission {
                    method: step.id.clone(),
                    params,
                    resource_requirement: Some(req),
                    ..Default::default()
                })
                .await
                .map_err(|e| e.to_string())?;

            loop {
                if let Some(task) = self.orchestrator.get_task(&task_id).await {
                    match task.status {
                        crate::orchestrator::task::TaskStatus::Completed => {
                            return Ok(task.result.unwrap_or(serde_json::Value::Null));
                        }
                        crate::orchestrator::task::TaskStatus::Failed => {
                            return Err(task.error.unwrap_or_else(|| "task failed".to_string()));
                        }
                        _ => {}
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        } else {
            step.execute.execute(variables).await
        }
    }

    async fn mark_running(&self, workflow_id: &str, step_id: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(workflow_id) {
            if let Some(step_state) = state.step_state_mut(step_id) {
                step_state.status = StepStatus::Running;
                step_state.started_at = Some(Utc::now());
            }
            state.updated_at = Utc::now();
        }
    }

    async fn mark_skipped(&self, workflow_id: &str, step_id: &str) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(workflow_id) {
            if let Some(step_state) = state.step_state_mut(step_id) {
                step_state.status = StepStatus::Skipped;
                step_state.result = Some(serde_json::Value::String(SKIPPED_SENTINEL.to_string()));
                step_state.completed_at = Some(Utc::now());
            }
        }
    }

    async fn mark_completed(
        &self,
        workflow_id: &str,
        step: &Step,
        result: serde_json::Value,
        duration: Duration,
        attempts: u32,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(workflow_id) {
            if let Some(output_var) = &step.output_variable {
                state.variables.insert(output_var.clone(), result.clone());
            }
            if let Some(step_state) = state.step_state_mut(&step.id) {
                step_state.status = StepStatus::Completed;
                step_state.result = Some(result);
                step_state.completed_at = Some(Utc::now());
                step_state.attempts = attempts;
                step_state.metrics.duration_ms = duration.as_millis() as u64;
            }
            state.completion_order.push(step.id.clone());
            state.updated_at = Utc::now();
        }
        self.events.publish(
            Event::new("workflow:step:completed")
                .with_workflow(workflow_id.to_string())
                .with_step(step.id.clone()),
        );
    }

    async fn mark_failed(
        &self,
        workflow_id: &str,
        step_id: &str,
        message: String,
        duration: Duration,
        attempts: u32,
    ) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(workflow_id) {
            if let Some(step_state) = state.step_state_mut(step_id) {
                step_state.status = StepStatus::Failed;
                step_state.error = Some(message.clone());
                step_state.completed_at = Some(Utc::now());
                step_state.attempts = attempts;
                step_state.metrics.duration_ms = duration.as_millis() as u64;
            }
            state.updated_at = Utc::now();
        }
        self.events.publish(
            Event::new("workflow:step:failed")
                .with_workflow(workflow_id.to_string())
                .with_step(step_id.to_string())
                .with_payload(serde_json::json!({ "error": message })),
        );
    }

    async fn complete(&self, workflow_id: &str) {
        {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(workflow_id) {
                state.status = WorkflowStatus::Completed;
                state.updated_at = Utc::now();
            }
        }
        self.resource_manager.release(&workflow_reservation_key(workflow_id)).await;
        self.events
            .publish(Event::new("workflow:completed").with_workflow(workflow_id.to_string()));
        info!(workflow_id, "workflow completed");
    }

    /// Run completed steps' rollback handlers in reverse completion order
    /// (§3, §4.6 abort path). Rollback failures are logged and emit
    /// `workflow:rollback:failed` but the sequence continues.
    async fn abort_path(&self, workflow_id: &str, definition: &WorkflowDefinition) {
        let rollback_on_error = definition.rollback_on_error;

        if !rollback_on_error {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(workflow_id) {
                state.status = WorkflowStatus::Failed;
                state.updated_at = Utc::now();
            }
            drop(states);
            self.resource_manager.release(&workflow_reservation_key(workflow_id)).await;
            self.events
                .publish(Event::new("workflow:failed").with_workflow(workflow_id.to_string()));
            return;
        }

        self.run_rollback(workflow_id, definition, WorkflowStatus::RolledBack)
            .await;
    }

    async fn run_rollback(
        &self,
        workflow_id: &str,
        definition: &WorkflowDefinition,
        terminal_status: WorkflowStatus,
    ) {
        {
            let mut states = self.states.write().await;
            if let Some(state) = states.get_mut(workflow_id) {
                state.status = WorkflowStatus::RollingBack;
                state.updated_at = Utc::now();
            }
        }

        let (completion_order, variables) = {
            let states = self.states.read().await;
            let state = states.get(workflow_id).expect("workflow exists");
            (state.completion_order.clone(), state.variables.clone())
        };

        for step_id in completion_order.into_iter().rev() {
            let Some(step) = definition.step(&step_id) else {
                continue;
            };
            let Some(rollback) = &step.rollback else {
                continue;
            };
            if let Err(err) = rollback.rollback(&variables).await {
                error!(workflow_id, step_id, %err, "rollback failed, continuing sequence");
                self.events.publish(
                    Event::new("workflow:rollback:failed")
                        .with_workflow(workflow_id.to_string())
                        .with_step(step_id.clone())
                        .with_payload(serde_json::json!({ "error": err })),
                );
            }
        }

        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(workflow_id) {
            // cancel() pins CANCELLED as terminal even after rollback runs
            if state.status == WorkflowStatus::RollingBack {
                state.status = terminal_status;
            }
            state.updated_at = Utc::now();
        }
        drop(states);
        self.resource_manager.release(&workflow_reservation_key(workflow_id)).await;
        self.events
            .publish(Event::new("workflow:rollback:completed").with_workflow(workflow_id.to_string()));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn pause(&self, workflow_id: &str) -> Result<()> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        if state.status != WorkflowStatus::Running {
            return Err(WorkflowError::PreconditionFailed(
                "pause is only valid from RUNNING".to_string(),
            ));
        }
        state.status = WorkflowStatus::Paused;
        state.updated_at = Utc::now();
        Ok(())
    }

    pub async fn resume(&self, workflow_id: &str) -> Result<()> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        if state.status != WorkflowStatus::Paused {
            return Err(WorkflowError::PreconditionFailed(
                "resume is only valid from PAUSED".to_string(),
            ));
        }
        state.status = WorkflowStatus::Running;
        state.updated_at = Utc::now();
        Ok(())
    }

    /// Valid from {PENDING, RUNNING, PAUSED}. The terminal state stays
    /// CANCELLED even when `rollbackOnCancel` runs rollback handlers.
    pub async fn cancel(self: &Arc<Self>, workflow_id: &str) -> Result<()> {
        let definition = self.definition_of(workflow_id).await?;
        let rollback_on_cancel = {
            let mut states = self.states.write().await;
            let state = states
                .get_mut(workflow_id)
                .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
            if !matches!(
                state.status,
                WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Paused
            ) {
                return Err(WorkflowError::PreconditionFailed(
                    "cancel is only valid from PENDING, RUNNING, or PAUSED".to_string(),
                ));
            }
            state.status = WorkflowStatus::Cancelled;
            state.updated_at = Utc::now();
            definition.rollback_on_cancel
        };

        self.events
            .publish(Event::new("workflow:cancelled").with_workflow(workflow_id.to_string()));

        if rollback_on_cancel {
            self.run_rollback(workflow_id, &definition, WorkflowStatus::Cancelled)
                .await;
        } else {
            self.resource_manager.release(&workflow_reservation_key(workflow_id)).await;
        }
        Ok(())
    }

    pub async fn get_state(&self, workflow_id: &str) -> Option<WorkflowState> {
        self.states.read().await.get(workflow_id).cloned()
    }

    // ========================================================================
    // Critical-resource reaction and maintenance
    // ========================================================================

    /// If C1 emits `critical`, pause all RUNNING workflows below CRITICAL
    /// priority (§4.6).
    pub fn spawn_critical_resource_reaction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let mut alerts = self.resource_manager.subscribe_alerts();
        tokio::spawn(async move {
            while let Ok((level, _dimension)) = alerts.recv().await {
                if level != AlertLevel::Critical {
                    continue;
                }
                let mut states = this.states.write().await;
                for state in states.values_mut() {
                    if state.status == WorkflowStatus::Running && state.priority < Priority::Critical {
                        state.status = WorkflowStatus::Paused;
                        state.updated_at = Utc::now();
                    }
                }
            }
        })
    }

    /// Evicts non-RUNNING workflows untouched for `cacheTimeout` every 60s.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                this.evict_stale().await;
            }
        })
    }

    async fn evict_stale(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.cache_timeout()).unwrap();
        let mut states = self.states.write().await;
        let mut definitions = self.definitions.write().await;
        states.retain(|id, state| {
            let active = matches!(state.status, WorkflowStatus::Running | WorkflowStatus::RollingBack);
            let keep = active || state.updated_at > cutoff;
            if !keep {
                definitions.remove(id);
            }
            keep
        });
    }
}

fn is_terminal(status: WorkflowStatus) -> bool {
    matches!(
        status,
        WorkflowStatus::Completed
            | WorkflowStatus::Failed
            | WorkflowStatus::Cancelled
            | WorkflowStatus::RolledBack
    )
}

fn workflow_reservation_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

enum StepOutcome {
    Completed,
    Skipped,
    FailedContinue,
    Abort,
}
