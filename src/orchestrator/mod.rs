//! Orchestrator (C5)
//!
//! Owns task lifecycle and is the only component permitted to transition
//! task status: admission, routing, dispatch via JSON-RPC, retry, metrics.
//! Grounded on `axon::orchestration::mod::Orchestrator`'s
//! scheduler/executor/validator composition, generalized to the JSON-RPC
//! dispatch loop described in §4.5.

pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::events::{Event, EventBus};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::resource::{AlertLevel, ResourceManager, ResourceRequirement};
use crate::router::TaskRouter;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND};

use task::{resource_requirement_for_method, Task, TaskId, TaskStatus, TaskSubmission};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Resource(#[from] crate::resource::ResourceError),
    #[error(transparent)]
    Routing(#[from] crate::router::RoutingError),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// `{retryCount, startTime, dependencies, resourceReq}` — the orchestrator's
/// private bookkeeping for an in-flight task (§4.5 step 4).
#[derive(Debug, Clone)]
struct ExecutionContext {
    retry_count: u32,
    #[allow(dead_code)]
    start_time: chrono::DateTime<Utc>,
    dependencies: Vec<String>,
    resource_req: ResourceRequirement,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResourceUtilization {
    pub memory: f32,
    pub cpu: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub task_count: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_processing_time_ms: f64,
    pub active_agents: usize,
    pub resource_utilization: ResourceUtilization,
}

struct MetricsInner {
    task_count: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    total_processing_ms: AtomicU64,
    processing_samples: AtomicU64,
    active_agents: AtomicUsize,
    resource_utilization: RwLock<ResourceUtilization>,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            task_count: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            total_processing_ms: AtomicU64::new(0),
            processing_samples: AtomicU64::new(0),
            active_agents: AtomicUsize::new(0),
            resource_utilization: RwLock::new(ResourceUtilization::default()),
        }
    }
}

/// Owns task lifecycle. Queues, routes, dispatches via JSON-RPC, retries,
/// and reports metrics.
pub struct Orchestrator {
    config: Settings,
    resource_manager: Arc<ResourceManager>,
    registry: Arc<AgentRegistry>,
    router: Arc<TaskRouter>,
    queue: Arc<TaskQueue>,
    events: Arc<EventBus>,
    http: reqwest::Client,
    contexts: RwLock<HashMap<String, ExecutionContext>>,
    active_task_count: AtomicUsize,
    processing_enabled: AtomicBool,
    metrics: MetricsInner,
    dispatches: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        config: Settings,
        resource_manager: Arc<ResourceManager>,
        registry: Arc<AgentRegistry>,
        router: Arc<TaskRouter>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let queue = TaskQueue::new(10_000);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            resource_manager,
            registry,
            router,
            queue,
            events,
            http: reqwest::Client::new(),
            contexts: RwLock::new(HashMap::new()),
            active_task_count: AtomicUsize::new(0),
            processing_enabled: AtomicBool::new(true),
            metrics: MetricsInner::new(),
            dispatches: Mutex::new(JoinSet::new()),
            shutdown,
        })
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// `submitTask(partial) -> taskId` (§4.5).
    pub async fn submit_task(&self, submission: TaskSubmission) -> Result<String> {
        let resource_req = submission
            .resource_requirement
            .unwrap_or_else(|| resource_requirement_for_method(&submission.method, &self.config.memory_tiers));

        if !self.resource_manager.can_handle(&resource_req).await {
            return Err(crate::resource::ResourceError::InsufficientResources(format!(
                "method {} requires {} bytes / {}% cpu",
                submission.method, resource_req.memory_bytes, resource_req.cpu_percent
            ))
            .into());
        }

        let target = submission.target_agent.clone();
        let method = submission.method.clone();
        self.router.route(&method, target.as_deref()).await?;

        let dependencies = submission.dependencies.clone();
        let task = Task::from_submission(submission, resource_req);
        let task_id = task.id.clone();

        self.contexts.write().await.insert(
            task_id.clone(),
            ExecutionContext {
                retry_count: 0,
                start_time: Utc::now(),
                dependencies,
                resource_req,
            },
        );

        self.queue.enqueue(task).await?;
        self.metrics.task_count.fetch_add(1, Ordering::Relaxed);
        info!(task_id = %task_id, "task admitted");
        Ok(task_id)
    }

    /// Succeeds only when the task hasn't begun dispatch.
    pub async fn cancel_task(&self, id: &str) -> Result<bool> {
        let Some(mut task) = self.queue.get_task(id).await else {
            return Err(OrchestratorError::NotFound(id.to_string()));
        };
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Failed;
        task.error = Some("cancelled".to_string());
        task.updated_at = Utc::now();
        self.queue.update_task(task).await;
        self.resource_manager.release(id).await;
        self.contexts.write().await.remove(id);
        Ok(true)
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.queue.get_task(id).await
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    /// Runs at ~10Hz while `active_task_count < max_concurrent_tasks` and
    /// processing is enabled. Every spawned dispatch is tracked in
    /// `self.dispatches` so `shutdown` can drain it (§9 "fire-and-forget").
    pub fn spawn_dispatch_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            let mut shutdown_rx = this.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                this.dispatch_tick().await;
            }
        })
    }

    async fn dispatch_tick(self: &Arc<Self>) {
        if !self.processing_enabled.load(Ordering::SeqCst) {
            return;
        }
        if self.active_task_count.load(Ordering::SeqCst) >= self.config.max_concurrent_tasks {
            return;
        }

        let Some(task) = self.queue.dequeue().await else {
            return;
        };

        let ctx = {
            let contexts = self.contexts.read().await;
            contexts.get(&task.id).cloned()
        };
        let Some(ctx) = ctx else {
            // context was cleared (e.g. cancelled concurrently); drop silently
            return;
        };

        if !self.dependencies_ready(&ctx.dependencies).await {
            let _ = self.queue.requeue_tail(task).await;
            return;
        }

        if !self.resource_manager.reserve(task.id.clone(), ctx.resource_req).await {
            let _ = self.queue.requeue_tail(task).await;
            return;
        }

        self.active_task_count.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        let mut dispatches = self.dispatches.lock().await;
        dispatches.spawn(async move {
            this.run_dispatch(task).await;
            this.active_task_count.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn dependencies_ready(&self, dependencies: &[String]) -> bool {
        for dep in dependencies {
            match self.queue.get_task(dep).await {
                Some(t) if t.status == TaskStatus::Completed => continue,
                _ => return false,
            }
        }
        true
    }

    /// Dispatch operation for one task: verify the agent, POST the JSON-RPC
    /// envelope under the requirement's timeout, retry retryable failures up
    /// to `retryAttempts`, and always release the reservation and clear the
    /// context on every exit path (§4.5).
    async fn run_dispatch(self: &Arc<Self>, mut task: Task) {
        let target = match task.target_agent.clone() {
            Some(t) => t,
            None => match self.router.route(&task.method, None).await {
                Ok(agent) => agent.id,
                Err(err) => {
                    self.finish_failed(&mut task, err.to_string()).await;
                    return;
                }
            },
        };

        loop {
            let started = std::time::Instant::now();
            match self.dispatch_once(&task, &target).await {
                DispatchOutcome::Completed(result) => {
                    let elapsed = started.elapsed();
                    self.router
                        .record_dispatch(&target, elapsed.as_millis() as f32, true)
                        .await;
                    self.finish_completed(&mut task, result, elapsed).await;
                    return;
                }
                DispatchOutcome::RemoteError(message) => {
                    self.router
                        .record_dispatch(&target, started.elapsed().as_millis() as f32, false)
                        .await;
                    self.finish_failed(&mut task, message).await;
                    return;
                }
                DispatchOutcome::Retryable(message) => {
                    self.router
                        .record_dispatch(&target, started.elapsed().as_millis() as f32, false)
                        .await;
                    let mut contexts = self.contexts.write().await;
                    let Some(ctx) = contexts.get_mut(&task.id) else {
                        return;
                    };
                    ctx.retry_count += 1;
                    if ctx.retry_count >= self.config.retry_attempts {
                        drop(contexts);
                        self.finish_failed(&mut task, message).await;
                        return;
                    }
                    drop(contexts);
                    warn!(task_id = %task.id, attempt = ?message, "retrying after delay");
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }

    async fn dispatch_once(&self, task: &Task, target_id: &str) -> DispatchOutcome {
        let Some(agent) = self.registry.get(target_id).await else {
            return DispatchOutcome::Retryable("target agent not found".to_string());
        };
        if agent.status != crate::registry::AgentStatus::Online {
            return DispatchOutcome::Retryable("target agent offline".to_string());
        }

        let request = JsonRpcRequest::new(task.method.clone(), task.params.clone(), task.id.clone());
        let timeout = Duration::from_millis(task.resource_requirement.timeout_ms);

        let response = self
            .http
            .post(&agent.endpoint)
            .header("Content-Type", "application/json")
            .json(&request)
            .timeout(timeout)
            .send()
            .await;

        let response = match response {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                return DispatchOutcome::Retryable(format!("HTTP {}", resp.status()));
            }
            Err(err) if err.is_timeout() => {
                return DispatchOutcome::Retryable("timeout".to_string());
            }
            Err(err) => {
                return DispatchOutcome::Retryable(err.to_string());
            }
        };

        let parsed: std::result::Result<JsonRpcResponse, _> = response.json().await;
        let parsed = match parsed {
            Ok(p) => p,
            Err(err) => return DispatchOutcome::Retryable(format!("malformed response: {err}")),
        };

        if let Some(err) = parsed.error {
            let note = if err.code == METHOD_NOT_FOUND {
                format!("Method not found: {}", err.message)
            } else {
                err.message
            };
            return DispatchOutcome::RemoteError(note);
        }

        DispatchOutcome::Completed(parsed.result.unwrap_or(serde_json::Value::Null))
    }

    async fn finish_completed(&self, task: &mut Task, result: serde_json::Value, elapsed: Duration) {
        task.status = TaskStatus::Completed;
        task.result = Some(result.clone());
        task.updated_at = Utc::now();
        self.queue.update_task(task.clone()).await;
        self.resource_manager.release(&task.id).await;
        self.contexts.write().await.remove(&task.id);
        self.metrics.completed_tasks.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_processing_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.metrics.processing_samples.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            Event::new("task:completed")
                .with_task(task.id.clone())
                .with_payload(result),
        );
        debug!(task_id = %task.id, "task completed");
    }

    async fn finish_failed(&self, task: &mut Task, message: String) {
        task.status = TaskStatus::Failed;
        task.error = Some(message.clone());
        task.updated_at = Utc::now();
        self.queue.update_task(task.clone()).await;
        self.resource_manager.release(&task.id).await;
        self.contexts.write().await.remove(&task.id);
        self.metrics.failed_tasks.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            Event::new("task:failed")
                .with_task(task.id.clone())
                .with_payload(serde_json::json!({ "error": message })),
        );
        error!(task_id = %task.id, "task failed");
    }

    // ========================================================================
    // Metrics and resource-critical reaction
    // ========================================================================

    pub async fn metrics(&self) -> OrchestratorMetrics {
        let total = self.metrics.processing_samples.load(Ordering::Relaxed);
        let average_processing_time_ms = if total > 0 {
            self.metrics.total_processing_ms.load(Ordering::Relaxed) as f64 / total as f64
        } else {
            0.0
        };
        OrchestratorMetrics {
            task_count: self.metrics.task_count.load(Ordering::Relaxed),
            completed_tasks: self.metrics.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.metrics.failed_tasks.load(Ordering::Relaxed),
            average_processing_time_ms,
            active_agents: self.metrics.active_agents.load(Ordering::Relaxed),
            resource_utilization: *self.metrics.resource_utilization.read().await,
        }
    }

    /// Periodic refresh (~5s): reads the registry's ONLINE count and the
    /// resource manager's utilization into the metrics snapshot.
    pub fn spawn_metrics_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let online = this.registry.count_online().await;
                this.metrics.active_agents.store(online, Ordering::Relaxed);

                let snapshot = this.resource_manager.snapshot().await;
                let mut util = this.metrics.resource_utilization.write().await;
                util.memory = snapshot.utilization_percentages.memory;
                util.cpu = snapshot.utilization_percentages.cpu;
            }
        })
    }

    /// On `critical`, disable new dispatches for `2 * retryDelay` (§4.5).
    pub fn spawn_resource_critical_hook(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let mut alerts = self.resource_manager.subscribe_alerts();
        tokio::spawn(async move {
            while let Ok((level, dimension)) = alerts.recv().await {
                if level == AlertLevel::Critical {
                    warn!(dimension, "resource critical, pausing dispatch");
                    this.processing_enabled.store(false, Ordering::SeqCst);
                    let cooldown = this.config.retry_delay() * 2;
                    let this2 = this.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(cooldown).await;
                        this2.processing_enabled.store(true, Ordering::SeqCst);
                        info!("resuming dispatch after resource cooldown");
                    });
                }
            }
        })
    }

    pub fn active_task_count(&self) -> usize {
        self.active_task_count.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Signal all tickers to stop and drain in-flight dispatches.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut dispatches = self.dispatches.lock().await;
        while dispatches.join_next().await.is_some() {}
    }
}

enum DispatchOutcome {
    Completed(serde_json::Value),
    RemoteError(String),
    Retryable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Capability, RegisteredAgent};
    use crate::resource::ResourceLimits;

    async fn build() -> (Arc<Orchestrator>, Arc<AgentRegistry>) {
        let limits = ResourceLimits {
            memory_max: 4 << 30,
            memory_warning: 3 << 30,
            cpu_max: 100.0,
            cpu_warning: 80.0,
        };
        let resources = ResourceManager::new(limits);
        let registry = AgentRegistry::new();
        let router = TaskRouter::new(registry.clone());
        let events = Arc::new(EventBus::new(64));
        let orchestrator = Orchestrator::new(Settings::default(), resources, registry.clone(), router, events);
        (orchestrator, registry)
    }

    #[tokio::test]
    async fn submit_task_fails_without_capable_agent() {
        let (orchestrator, _registry) = build().await;
        let err = orchestrator
            .submit_task(TaskSubmission {
                method: "Bar".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Routing(_)));
    }

    #[tokio::test]
    async fn submit_task_insufficient_resources() {
        let (orchestrator, registry) = build().await;
        registry
            .register(RegisteredAgent {
                id: "a1".to_string(),
                endpoint: "http://localhost:1".to_string(),
                capabilities: vec![Capability {
                    name: "videoProcessing".to_string(),
                    methods: vec!["videoProcessing".to_string()],
                    version: "1".to_string(),
                }],
            })
            .await
            .unwrap();

        let huge_req = ResourceRequirement::new(8 << 30, 10.0, 1000);
        let err = orchestrator
            .submit_task(TaskSubmission {
                method: "videoProcessing".to_string(),
                resource_requirement: Some(huge_req),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Resource(_)));
    }

    #[tokio::test]
    async fn cancel_pending_task_succeeds_once() {
        let (orchestrator, registry) = build().await;
        registry
            .register(RegisteredAgent {
                id: "a1".to_string(),
                endpoint: "http://localhost:1".to_string(),
                capabilities: vec![Capability {
                    name: "generic".to_string(),
                    methods: vec!["Foo".to_string()],
                    version: "1".to_string(),
                }],
            })
            .await
            .unwrap();

        let id = orchestrator
            .submit_task(TaskSubmission {
                method: "Foo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(orchestrator.cancel_task(&id).await.unwrap());
        assert!(!orchestrator.cancel_task(&id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_not_found() {
        let (orchestrator, _registry) = build().await;
        let err = orchestrator.cancel_task("ghost").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_task_returns_none_for_unknown_id() {
        let (orchestrator, _registry) = build().await;
        assert!(orchestrator.get_task("ghost").await.is_none());
    }

    #[tokio::test]
    async fn metrics_reflect_task_count_on_submission() {
        let (orchestrator, registry) = build().await;
        registry
            .register(RegisteredAgent {
                id: "a1".to_string(),
                endpoint: "http://localhost:1".to_string(),
                capabilities: vec![Capability {
                    name: "generic".to_string(),
                    methods: vec!["Foo".to_string()],
                    version: "1".to_string(),
                }],
            })
            .await
            .unwrap();

        orchestrator
            .submit_task(TaskSubmission {
                method: "Foo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let metrics = orchestrator.metrics().await;
        assert_eq!(metrics.task_count, 1);
        assert_eq!(metrics.completed_tasks, 0);
    }
}
