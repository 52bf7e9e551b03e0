//! HTTP surface (§6)
//!
//! Thin axum front for the orchestrator and workflow engine. Grounded on
//! `axon`'s `tower`/`tower-http` (cors, trace) stack; not part of the core
//! itself, but the fixed contract collaborators are held to.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::CoreError;
use crate::events::EventBus;
use crate::monitor::Monitor;
use crate::orchestrator::task::TaskSubmission;
use crate::orchestrator::Orchestrator;
use crate::registry::{AgentRegistry, RegisteredAgent};
use crate::workflow::definition::CreateOptions;
use crate::workflow::spec::WorkflowSpec;
use crate::workflow::WorkflowEngine;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<AgentRegistry>,
    pub workflows: Arc<WorkflowEngine>,
    pub monitor: Arc<Monitor>,
    pub events: Arc<EventBus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents/register", post(register_agent))
        .route("/agents/:agent_id", delete(unregister_agent))
        .route("/tasks", post(submit_task))
        .route("/tasks/:task_id", get(get_task))
        .route("/workflows", post(submit_workflow))
        .route("/workflows/:workflow_id", get(get_workflow))
        .route("/workflows/:workflow_id/pause", post(pause_workflow))
        .route("/workflows/:workflow_id/resume", post(resume_workflow))
        .route("/workflows/:workflow_id/cancel", post(cancel_workflow))
        .route("/events", get(event_stream))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /health` → `{status:"ok"}` (§6).
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// `POST /agents/register` → 200 `{success:true}` or 400
/// `{success:false,error}` (§6).
async fn register_agent(
    State(state): State<AppState>,
    Json(agent): Json<RegisteredAgent>,
) -> Response {
    match state.registry.register(agent).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

/// `POST /tasks` → 200 `{taskId}` or 400 `{success:false,error}` (§6).
async fn submit_task(State(state): State<AppState>, Json(submission): Json<TaskSubmission>) -> Response {
    match state.orchestrator.submit_task(submission).await {
        Ok(task_id) => Json(json!({ "taskId": task_id })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

/// `DELETE /agents/:agentId` → 200 `{success:true}` or 404 (§4.2 ambient
/// addition — `unregister` is a registry operation but §6 doesn't fix its
/// transport; DELETE is the natural axum mapping).
async fn unregister_agent(State(state): State<AppState>, Path(agent_id): Path<String>) -> Response {
    match state.registry.unregister(&agent_id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

/// `GET /tasks/:taskId` → `{status}` or 404 (§6).
async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.orchestrator.get_task(&task_id).await {
        Some(task) => Json(task).into_response(),
        None => core_error_response(CoreError::NotFound(task_id)),
    }
}

/// `POST /workflows` → 200 `{workflowId}` or 400 `{success:false,error}`
/// (§6). Accepts a [`WorkflowSpec`] rather than a raw [`WorkflowDefinition`]:
/// every step names a method dispatched through the orchestrator, so the
/// engine never needs to construct a trait-object step body from JSON.
async fn submit_workflow(State(state): State<AppState>, Json(spec): Json<WorkflowSpec>) -> Response {
    match state.workflows.submit(spec, CreateOptions::default()).await {
        Ok(workflow_id) => Json(json!({ "workflowId": workflow_id })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

async fn get_workflow(State(state): State<AppState>, Path(workflow_id): Path<String>) -> Response {
    match state.workflows.get_state(&workflow_id).await {
        Some(wf_state) => Json(wf_state).into_response(),
        None => core_error_response(CoreError::NotFound(workflow_id)),
    }
}

/// `POST /workflows/:workflowId/pause` → 200 `{success:true}` or 409/404
/// (§4.6 lifecycle, exposed over HTTP since the CLI has no other way to
/// drive a running instance's workflows).
async fn pause_workflow(State(state): State<AppState>, Path(workflow_id): Path<String>) -> Response {
    match state.workflows.pause(&workflow_id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

/// `POST /workflows/:workflowId/resume` → 200 `{success:true}` or 409/404.
async fn resume_workflow(State(state): State<AppState>, Path(workflow_id): Path<String>) -> Response {
    match state.workflows.resume(&workflow_id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

/// `POST /workflows/:workflowId/cancel` → 200 `{success:true}` or 409/404.
async fn cancel_workflow(State(state): State<AppState>, Path(workflow_id): Path<String>) -> Response {
    match state.workflows.cancel(&workflow_id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => core_error_response(err.into()),
    }
}

#[derive(Deserialize)]
struct EventStreamQuery {
    /// Comma-separated topic prefixes (`workflow`, `step`, `rollback`,
    /// `task`, `resource`); absent or empty means "subscribe to everything".
    topics: Option<String>,
}

/// `GET /events?topics=workflow,task` → an SSE stream of lifecycle events
/// (§4.7, §6 "Event stream"). Each SSE event is named after the event's
/// `eventType` and carries the full [`Event`](crate::events::Event) as its
/// JSON data.
async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let topics = query
        .topics
        .map(|t| t.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    let subscription = state.events.subscribe(topics);

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = SseEvent::default()
            .event(event.event_type.clone())
            .json_data(event)
            .unwrap_or_else(|_| SseEvent::default().event("error"));
        Some((Ok(sse), subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /metrics` → orchestration metrics plus the C8 health-history tail
/// and C7's drop counter (§6 ambient addition).
async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator_metrics = state.orchestrator.metrics().await;
    let latest_health = state.monitor.latest().await;
    Json(json!({
        "orchestrator": orchestrator_metrics,
        "health": latest_health,
        "eventsDropped": state.events.dropped_count(),
    }))
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn core_error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::InvalidArgument(_) | CoreError::AlreadyExists(_) | CoreError::QueueFull => {
            StatusCode::BAD_REQUEST
        }
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::PreconditionFailed(_) => StatusCode::CONFLICT,
        CoreError::InsufficientResources(_) | CoreError::NoCapableAgent(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        CoreError::TransportError(_) | CoreError::RemoteError(_) => StatusCode::BAD_GATEWAY,
        CoreError::Cancelled => StatusCode::CONFLICT,
        CoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    info!(%err, %status, "request failed");
    (
        status,
        Json(ErrorBody {
            success: false,
            error: err.to_string(),
        }),
    )
        .into_response()
}
