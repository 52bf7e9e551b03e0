//! Loom - Agent Orchestration Core
//!
//! Loom couples a task scheduler/orchestrator with a DAG workflow engine,
//! sharing a resource manager and an agent registry, to dispatch work to a
//! fleet of remote agents over JSON-RPC.
//!
//! # Architecture
//!
//! - `resource` - admission control over memory/CPU reservations (C1)
//! - `registry` - agent directory with capability-based lookup (C2)
//! - `queue` - bounded FIFO task queue with a permanent by-id index (C3)
//! - `router` - weighted agent selection for a task's method (C4)
//! - `orchestrator` - task lifecycle: admit, route, dispatch, retry (C5)
//! - `workflow` - DAG compilation and step execution with rollback (C6)
//! - `events` - topic-prefixed pub/sub event bus (C7)
//! - `monitor` - periodic health snapshots with bounded history (C8)
//! - `rpc` - JSON-RPC 2.0 envelope types shared by dispatch and tests
//! - `server` - axum HTTP surface
//! - `config` - layered settings loading
//! - `error` - shared error taxonomy

pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod resource;
pub mod router;
pub mod rpc;
pub mod server;
pub mod workflow;

pub use config::Settings;
pub use error::{CoreError, Result};
pub use orchestrator::Orchestrator;
pub use workflow::WorkflowEngine;

/// Loom version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
