//! End-to-end scenarios (§8): orchestrator dispatch against a mock remote
//! agent, and workflow dependency/rollback ordering against local steps.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use loom::config::Settings;
use loom::events::{Event, EventBus, Subscription};
use loom::orchestrator::task::{Task, TaskStatus, TaskSubmission};
use loom::orchestrator::{Orchestrator, OrchestratorError};
use loom::registry::{AgentRegistry, Capability, RegisteredAgent};
use loom::resource::{ResourceLimits, ResourceManager, ResourceRequirement};
use loom::router::TaskRouter;
use loom::workflow::definition::{CreateOptions, Step, StepExecutor, StepRollback, Variables, WorkflowDefinition};
use loom::workflow::state::WorkflowStatus;
use loom::WorkflowEngine;

use common::{Behavior, MockAgent};

fn generous_limits() -> ResourceLimits {
    ResourceLimits {
        memory_max: 4 << 30,
        memory_warning: 3 << 30,
        cpu_max: 100.0,
        cpu_warning: 80.0,
    }
}

async fn build_orchestrator(settings: Settings, limits: ResourceLimits) -> (Arc<Orchestrator>, Arc<AgentRegistry>) {
    let resources = ResourceManager::new(limits);
    let registry = AgentRegistry::new();
    let router = TaskRouter::new(registry.clone());
    let events = Arc::new(EventBus::new(64));
    let orchestrator = Orchestrator::new(settings, resources, registry.clone(), router, events);
    orchestrator.spawn_dispatch_loop();
    (orchestrator, registry)
}

async fn register(registry: &AgentRegistry, id: &str, endpoint: &str, methods: &[&str]) {
    registry
        .register(RegisteredAgent {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            capabilities: vec![Capability {
                name: "cap".to_string(),
                methods: methods.iter().map(|m| m.to_string()).collect(),
                version: "1".to_string(),
            }],
        })
        .await
        .unwrap();
}

async fn wait_terminal(orchestrator: &Orchestrator, task_id: &str, timeout: Duration) -> Task {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(task) = orchestrator.get_task(task_id).await {
            if task.status.is_terminal() {
                return task;
            }
        }
        if Instant::now() >= deadline {
            panic!("task {task_id} did not reach a terminal state in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_event_of_type(sub: &mut Subscription, event_type: &str, timeout: Duration) -> Event {
    loop {
        let event = tokio::time::timeout(timeout, sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if event.event_type == event_type {
            return event;
        }
    }
}

// 1. Capability routing: an agent advertising the requested method gets
// picked without an explicit target, and a successful JSON-RPC reply
// completes the task with its result.
#[tokio::test]
async fn capability_routing_dispatches_to_matching_agent() {
    let agent = MockAgent::start(Behavior::AlwaysOk(json!("ok"))).await;
    let settings = Settings {
        retry_delay_ms: 20,
        ..Settings::default()
    };
    let (orchestrator, registry) = build_orchestrator(settings, generous_limits()).await;
    register(&registry, "claude-agent", &agent.endpoint, &["RequestRefactor"]).await;

    let task_id = orchestrator
        .submit_task(TaskSubmission {
            method: "RequestRefactor".to_string(),
            params: json!({"code_path": "/x", "instruction": "refactor please"}),
            ..Default::default()
        })
        .await
        .unwrap();

    let task = wait_terminal(&orchestrator, &task_id, Duration::from_secs(2)).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!("ok")));
}

// 2. No agent advertises the requested method: submission itself fails.
#[tokio::test]
async fn no_capable_agent_fails_at_submission() {
    let (orchestrator, registry) = build_orchestrator(Settings::default(), generous_limits()).await;
    register(&registry, "a1", "http://127.0.0.1:1", &["Foo"]).await;

    let err = orchestrator
        .submit_task(TaskSubmission {
            method: "Bar".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Routing(_)));
}

// 3. A transport-level failure is retried, and the task completes on the
// next attempt within the configured retry budget.
#[tokio::test]
async fn retry_then_success() {
    let agent = MockAgent::start(Behavior::FailThenOk {
        fail_calls: 1,
        result: json!("ok"),
    })
    .await;
    let settings = Settings {
        retry_attempts: 2,
        retry_delay_ms: 20,
        ..Settings::default()
    };
    let (orchestrator, registry) = build_orchestrator(settings, generous_limits()).await;
    register(&registry, "a1", &agent.endpoint, &["Foo"]).await;

    let task_id = orchestrator
        .submit_task(TaskSubmission {
            method: "Foo".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let task = wait_terminal(&orchestrator, &task_id, Duration::from_secs(2)).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(agent.call_count(), 2);
}

// 4. A JSON-RPC error object is terminal: no retry, and the message surfaces
// in the task's error.
#[tokio::test]
async fn remote_error_is_terminal_without_retry() {
    let agent = MockAgent::start(Behavior::RemoteError {
        code: -32601,
        message: "Method not found".to_string(),
    })
    .await;
    let settings = Settings {
        retry_attempts: 3,
        retry_delay_ms: 20,
        ..Settings::default()
    };
    let (orchestrator, registry) = build_orchestrator(settings, generous_limits()).await;
    register(&registry, "a1", &agent.endpoint, &["Foo"]).await;

    let task_id = orchestrator
        .submit_task(TaskSubmission {
            method: "Foo".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let task = wait_terminal(&orchestrator, &task_id, Duration::from_secs(2)).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("Method not found"));
    assert_eq!(agent.call_count(), 1);
}

struct Noop;

#[async_trait]
impl StepExecutor for Noop {
    async fn execute(&self, _variables: &Variables) -> Result<Value, String> {
        Ok(Value::Null)
    }
}

// Steps in these tests never carry a `resource_requirement`, so they run as
// local callables and never touch the orchestrator's dispatch path; it's
// still required to construct a `WorkflowEngine`.
fn workflow_harness(settings: Settings, limits: ResourceLimits) -> (Arc<WorkflowEngine>, Arc<EventBus>) {
    let resources = ResourceManager::new(limits);
    let registry = AgentRegistry::new();
    let router = TaskRouter::new(registry.clone());
    let events = Arc::new(EventBus::new(64));
    let orchestrator = Orchestrator::new(settings.clone(), resources.clone(), registry, router, events.clone());
    let workflows = WorkflowEngine::new(settings, resources, events.clone(), orchestrator);
    (workflows, events)
}

// 5. Dependency gating: a linear chain A -> B -> C starts its steps in
// exactly that order.
#[tokio::test]
async fn dependency_gating_orders_step_starts() {
    let (workflows, events) = workflow_harness(Settings::default(), generous_limits());
    let mut sub = events.subscribe(vec!["workflow".to_string()]);

    let definition = WorkflowDefinition {
        id: "wf-gate".to_string(),
        name: "gate".to_string(),
        version: "1".to_string(),
        steps: vec![
            Step::builder("A", Arc::new(Noop)).build(),
            Step::builder("B", Arc::new(Noop)).depends_on(["A"]).build(),
            Step::builder("C", Arc::new(Noop)).depends_on(["B"]).build(),
        ],
        max_concurrent_steps: 4,
        rollback_on_error: false,
        rollback_on_cancel: false,
        continue_on_error: false,
        variables: Default::default(),
        timeout: None,
    };

    let workflow_id = workflows.create(definition, CreateOptions::default()).await.unwrap();
    workflows.start(&workflow_id).await.unwrap();

    let mut started = Vec::new();
    for _ in 0..3 {
        let event = next_event_of_type(&mut sub, "workflow:step:started", Duration::from_secs(2)).await;
        started.push(event.step_id.unwrap());
    }

    assert_eq!(started, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

struct FailStep;

#[async_trait]
impl StepExecutor for FailStep {
    async fn execute(&self, _variables: &Variables) -> Result<Value, String> {
        Err("boom".to_string())
    }
}

struct RecordingRollback {
    id: String,
    log: Arc<AsyncMutex<Vec<String>>>,
}

#[async_trait]
impl StepRollback for RecordingRollback {
    async fn rollback(&self, _variables: &Variables) -> Result<(), String> {
        self.log.lock().await.push(self.id.clone());
        Ok(())
    }
}

// 6. Rollback order: when S3 fails after S1 and S2 completed, rollback runs
// in strictly reverse completion order: [S2, S1].
#[tokio::test]
async fn rollback_runs_in_reverse_completion_order() {
    let (workflows, _events) = workflow_harness(Settings::default(), generous_limits());
    let log: Arc<AsyncMutex<Vec<String>>> = Arc::new(AsyncMutex::new(Vec::new()));

    let definition = WorkflowDefinition {
        id: "wf-rollback".to_string(),
        name: "rollback".to_string(),
        version: "1".to_string(),
        steps: vec![
            Step::builder("S1", Arc::new(Noop))
                .rollback(Arc::new(RecordingRollback {
                    id: "S1".to_string(),
                    log: log.clone(),
                }))
                .build(),
            Step::builder("S2", Arc::new(Noop))
                .depends_on(["S1"])
                .rollback(Arc::new(RecordingRollback {
                    id: "S2".to_string(),
                    log: log.clone(),
                }))
                .build(),
            Step::builder("S3", Arc::new(FailStep)).depends_on(["S2"]).build(),
        ],
        max_concurrent_steps: 4,
        rollback_on_error: true,
        rollback_on_cancel: false,
        continue_on_error: false,
        variables: Default::default(),
        timeout: None,
    };

    let workflow_id = workflows.create(definition, CreateOptions::default()).await.unwrap();
    workflows.start(&workflow_id).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let state = workflows.get_state(&workflow_id).await.unwrap();
        if state.status == WorkflowStatus::RolledBack {
            break;
        }
        assert!(Instant::now() < deadline, "workflow did not roll back in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let order = log.lock().await.clone();
    assert_eq!(order, vec!["S2".to_string(), "S1".to_string()]);
}

// 7. Concurrency cap: ten submissions against a slow agent never exceed
// `maxConcurrentTasks` calls in flight at once.
#[tokio::test]
async fn concurrency_cap_bounds_in_flight_dispatches() {
    let agent = MockAgent::start(Behavior::SlowOk {
        delay: Duration::from_millis(200),
        result: json!("ok"),
    })
    .await;
    let settings = Settings {
        max_concurrent_tasks: 3,
        retry_delay_ms: 20,
        ..Settings::default()
    };
    let (orchestrator, registry) = build_orchestrator(settings, generous_limits()).await;
    register(&registry, "a1", &agent.endpoint, &["Foo"]).await;

    let mut task_ids = Vec::new();
    for _ in 0..10 {
        let id = orchestrator
            .submit_task(TaskSubmission {
                method: "Foo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        task_ids.push(id);
    }

    for id in &task_ids {
        wait_terminal(&orchestrator, id, Duration::from_secs(5)).await;
    }

    assert!(agent.max_in_flight() <= 3, "observed {} in flight, expected at most 3", agent.max_in_flight());
    assert_eq!(agent.call_count(), 10);
}

// 8. Resource admission: a task requiring more memory than the configured
// limit is refused at submission and never enters the queue.
#[tokio::test]
async fn resource_admission_refuses_oversized_task() {
    let limits = ResourceLimits {
        memory_max: 1 << 30,
        memory_warning: (1 << 30) * 3 / 4,
        cpu_max: 100.0,
        cpu_warning: 80.0,
    };
    let (orchestrator, registry) = build_orchestrator(Settings::default(), limits).await;
    register(&registry, "a1", "http://127.0.0.1:1", &["videoProcessing"]).await;

    let oversized = ResourceRequirement::new(2 << 30, 10.0, 1000);
    let err = orchestrator
        .submit_task(TaskSubmission {
            method: "videoProcessing".to_string(),
            resource_requirement: Some(oversized),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Resource(_)));
    assert_eq!(orchestrator.queue().size().await, 0);
}
