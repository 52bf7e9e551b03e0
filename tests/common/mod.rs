//! Mock remote agent for end-to-end tests (§8).
//!
//! A tiny axum server standing in for the remote agent the orchestrator
//! dispatches JSON-RPC requests to. The mocked agent itself isn't a core
//! component, so it lives here rather than under `src/`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

/// Scripted response behavior for a [`MockAgent`].
#[derive(Clone)]
pub enum Behavior {
    /// Every call succeeds with `result`.
    AlwaysOk(Value),
    /// The first `fail_calls` calls return a transport-level failure (HTTP
    /// 500); calls after that succeed with `result`.
    FailThenOk { fail_calls: usize, result: Value },
    /// Every call returns a JSON-RPC error object.
    RemoteError { code: i64, message: String },
    /// Every call sleeps `delay` before succeeding with `result`, so tests
    /// can observe how many calls are in flight at once.
    SlowOk { delay: Duration, result: Value },
}

struct Shared {
    behavior: Behavior,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A running mock agent bound to an ephemeral localhost port.
pub struct MockAgent {
    pub endpoint: String,
    shared: Arc<Shared>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockAgent {
    pub async fn start(behavior: Behavior) -> Self {
        let shared = Arc::new(Shared {
            behavior,
            call_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/rpc", post(handle_rpc))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock agent listener");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock agent server");
        });

        Self {
            endpoint: format!("http://{addr}/rpc"),
            shared,
            _handle: handle,
        }
    }

    pub fn call_count(&self) -> usize {
        self.shared.call_count.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn handle_rpc(State(shared): State<Arc<Shared>>, Json(body): Json<Value>) -> Response {
    let call_number = shared.call_count.fetch_add(1, Ordering::SeqCst) + 1;
    let in_flight = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    shared.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    let response = match &shared.behavior {
        Behavior::AlwaysOk(result) => ok_response(result.clone(), id),
        Behavior::FailThenOk { fail_calls, result } => {
            if call_number <= *fail_calls {
                (StatusCode::INTERNAL_SERVER_ERROR, "stub failure").into_response()
            } else {
                ok_response(result.clone(), id)
            }
        }
        Behavior::RemoteError { code, message } => Json(json!({
            "jsonrpc": "2.0",
            "error": { "code": code, "message": message },
            "id": id,
        }))
        .into_response(),
        Behavior::SlowOk { delay, result } => {
            tokio::time::sleep(*delay).await;
            ok_response(result.clone(), id)
        }
    };

    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

fn ok_response(result: Value, id: Value) -> Response {
    Json(json!({ "jsonrpc": "2.0", "result": result, "id": id })).into_response()
}
