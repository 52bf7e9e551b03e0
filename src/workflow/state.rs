//! Workflow runtime state (§3)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::{Priority, Variables};
use crate::orchestrator::ResourceUtilization as StepResourceUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub duration_ms: u64,
    pub memory_usage: u64,
    pub cpu_usage: f32,
}

impl Default for StepMetrics {
    fn default() -> Self {
        Self {
            duration_ms: 0,
            memory_usage: 0,
            cpu_usage: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub metrics: StepMetrics,
}

impl StepState {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            attempts: 0,
            metrics: StepMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub current: StepResourceUsage,
    pub peak: StepResourceUsage,
}

/// `{id, definition, status, currentStep, stepStates[], variables,
/// priority, resourceUsage, createdAt, updatedAt, error?}` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub step_states: Vec<StepState>,
    pub variables: Variables,
    pub priority: Priority,
    pub resource_usage: ResourceUsage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    /// completion order, oldest first — rollback replays this in reverse
    /// (§3 workflow invariant).
    pub completion_order: Vec<String>,
}

impl WorkflowState {
    pub fn step_state_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.step_states.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.iter().find(|s| s.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_step_state_starts_clean() {
        let state = StepState::pending("s1");
        assert_eq!(state.status, StepStatus::Pending);
        assert_eq!(state.attempts, 0);
        assert!(state.result.is_none());
        assert!(state.error.is_none());
        assert!(state.started_at.is_none());
    }

    fn sample_workflow_state() -> WorkflowState {
        WorkflowState {
            id: "wf1".to_string(),
            definition_id: "def1".to_string(),
            status: WorkflowStatus::Running,
            current_step: 0,
            step_states: vec![StepState::pending("a"), StepState::pending("b")],
            variables: Variables::default(),
            priority: Priority::Normal,
            resource_usage: ResourceUsage {
                current: StepResourceUsage::default(),
                peak: StepResourceUsage::default(),
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error: None,
            completion_order: Vec::new(),
        }
    }

    #[test]
    fn step_state_lookup_finds_by_id_and_misses_otherwise() {
        let mut state = sample_workflow_state();
        assert!(state.step_state("a").is_some());
        assert!(state.step_state("missing").is_none());

        state.step_state_mut("b").unwrap().status = StepStatus::Completed;
        assert_eq!(state.step_state("b").unwrap().status, StepStatus::Completed);
        assert!(state.step_state_mut("missing").is_none());
    }
}
