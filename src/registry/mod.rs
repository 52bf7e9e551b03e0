//! Agent Registry (C2)
//!
//! In-memory directory of agents keyed by id, with capability lookup and a
//! background health prober, grounded on `axon::orchestration::worker_registry`'s
//! capability-indexed worker pool.

mod prober;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub use prober::spawn_health_prober;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent already registered: {0}")]
    AlreadyExists(String),
    #[error("agent not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A capability an agent advertises: `{name, methods[], version}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub name: String,
    pub methods: Vec<String>,
    pub version: String,
}

impl Capability {
    pub fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
}

/// A remote worker entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    pub fn advertises(&self, method: &str) -> bool {
        self.capabilities.iter().any(|c| c.supports(method))
    }

    /// Fraction of this agent's capability entries that include `method`
    /// (§4.4 scoring, 10% weight).
    pub fn capability_match_fraction(&self, method: &str) -> f32 {
        if self.capabilities.is_empty() {
            return 0.0;
        }
        let matching = self
            .capabilities
            .iter()
            .filter(|c| c.supports(method))
            .count();
        matching as f32 / self.capabilities.len() as f32
    }
}

/// Registration payload (identity + endpoint + capabilities, no status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredAgent {
    pub id: String,
    pub endpoint: String,
    pub capabilities: Vec<Capability>,
}

/// Keyed agent directory. All writes go through its own lock; `list` returns
/// a snapshot slice so callers never see torn state.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, agent: RegisteredAgent) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(RegistryError::AlreadyExists(agent.id));
        }
        info!(agent_id = %agent.id, "agent registered");
        agents.insert(
            agent.id.clone(),
            Agent {
                id: agent.id,
                endpoint: agent.endpoint,
                capabilities: agent.capabilities,
                status: AgentStatus::Online,
                last_seen: Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        let mut agents = self.agents.write().await;
        agents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn count_online(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status == AgentStatus::Online)
            .count()
    }

    /// Sets `lastSeen` to now on every call, authoritative last-writer-wins.
    pub async fn update_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        agent.status = status;
        agent.last_seen = Utc::now();
        debug!(agent_id = id, ?status, "agent status updated");
        Ok(())
    }
}
