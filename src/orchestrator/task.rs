//! Task data model (§3)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource::ResourceRequirement;

/// Opaque task id (UUID v4), newtype'd the way `axon::agents::AgentId` wraps
/// a raw string so call sites can't accidentally swap a task id for an agent
/// id. Serializes transparently as a bare string for the JSON-RPC `id` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A unit of work submitted by a client or the workflow engine (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
    pub source_agent: Option<String>,
    pub target_agent: Option<String>,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub resource_requirement: ResourceRequirement,
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial submission payload accepted by `Orchestrator::submit_task`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskSubmission {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub source_agent: Option<String>,
    pub target_agent: Option<String>,
    pub resource_requirement: Option<ResourceRequirement>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Task {
    pub fn from_submission(submission: TaskSubmission, resource_requirement: ResourceRequirement) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new().to_string(),
            method: submission.method,
            params: submission.params,
            source_agent: submission.source_agent,
            target_agent: submission.target_agent,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            resource_requirement,
            dependencies: submission.dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    /// Test/internal helper to build a task with a caller-chosen id.
    pub fn new_with_id(id: String, method: String, params: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            method,
            params,
            source_agent: None,
            target_agent: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            resource_requirement: crate::resource::tiers::SMALL,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derives `resourceRequirement` from `method` per the source's table
/// (§4.5): known methods map to known tiers, otherwise the small-tier
/// fallback. Memory sizes come from the configured `MemoryTiers`
/// (§6), not a hardcoded constant.
pub fn resource_requirement_for_method(method: &str, tiers: &crate::config::MemoryTiers) -> ResourceRequirement {
    use crate::resource::tiers::{large, medium, small, xlarge};
    match method {
        "processLargeData" | "imageProcessing" => medium(tiers),
        "videoProcessing" => large(tiers),
        "trainModel" => xlarge(tiers),
        _ => small(tiers),
    }
}
