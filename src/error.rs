//! Shared error taxonomy
//!
//! Each component defines its own error enum close to where it's used
//! (`resource::ResourceError`, `registry::RegistryError`, ...); this module
//! unifies them behind one type for callers — the HTTP surface and the CLI —
//! that need a single error to map onto a status code or exit code.

use crate::orchestrator::OrchestratorError;
use crate::queue::QueueError;
use crate::registry::RegistryError;
use crate::resource::ResourceError;
use crate::router::RoutingError;
use crate::workflow::WorkflowError;

/// Transport-neutral error kind, shared across components.
///
/// Mirrors the kinds every component can raise so HTTP handlers and the CLI
/// can match on one enum instead of threading per-component error types
/// through every call site.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("no capable agent for method {0}")]
    NoCapableAgent(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("queue full")]
    QueueFull,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("timeout")]
    Timeout,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ResourceError> for CoreError {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::InsufficientResources(msg) => CoreError::InsufficientResources(msg),
        }
    }
}

impl From<RegistryError> for CoreError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(id) => CoreError::AlreadyExists(id),
            RegistryError::NotFound(id) => CoreError::NotFound(id),
        }
    }
}

impl From<QueueError> for CoreError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::QueueFull => CoreError::QueueFull,
            QueueError::NotFound(id) => CoreError::NotFound(id),
        }
    }
}

impl From<RoutingError> for CoreError {
    fn from(e: RoutingError) -> Self {
        match e {
            RoutingError::NoCapableAgent(method) => CoreError::NoCapableAgent(method),
            RoutingError::TargetNotFound(id) => CoreError::NotFound(id),
            RoutingError::TargetNotEligible(id) => {
                CoreError::PreconditionFailed(format!("agent {id} not eligible"))
            }
        }
    }
}

impl From<OrchestratorError> for CoreError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Resource(e) => e.into(),
            OrchestratorError::Routing(e) => e.into(),
            OrchestratorError::Queue(e) => e.into(),
            OrchestratorError::NotFound(id) => CoreError::NotFound(id),
            OrchestratorError::PreconditionFailed(msg) => CoreError::PreconditionFailed(msg),
        }
    }
}

impl From<WorkflowError> for CoreError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::InvalidDefinition(msg) => CoreError::InvalidArgument(msg),
            WorkflowError::CycleDetected => {
                CoreError::InvalidArgument("cycle detected in workflow dependencies".into())
            }
            WorkflowError::NotFound(id) => CoreError::NotFound(id),
            WorkflowError::TooManyConcurrentWorkflows => {
                CoreError::InsufficientResources("maxConcurrentWorkflows reached".into())
            }
            WorkflowError::PreconditionFailed(msg) => CoreError::PreconditionFailed(msg),
            WorkflowError::Resource(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
