//! Task Router (C4)
//!
//! Selects a target agent for a task by capability filter plus a weighted
//! score over resource headroom, success rate, load balancing, latency, and
//! capability-match fraction (§4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::registry::{Agent, AgentRegistry, AgentStatus};

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no online agent advertises method {0}")]
    NoCapableAgent(String),
    #[error("target agent not found: {0}")]
    TargetNotFound(String),
    #[error("target agent not eligible: {0}")]
    TargetNotEligible(String),
}

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Per-agent metrics the router consults alongside the registry entry.
/// A freshly-observed agent with no entry here gets a neutral 0.5 score.
#[derive(Debug, Clone, Copy)]
pub struct AgentMetrics {
    pub success_rate: f32,
    pub avg_latency_ms: f32,
    pub last_used: chrono::DateTime<Utc>,
    pub cpu_util: f32,
    pub mem_util: f32,
}

pub struct TaskRouter {
    registry: Arc<AgentRegistry>,
    metrics: tokio::sync::RwLock<HashMap<String, AgentMetrics>>,
    load_balancing_window: Duration,
}

impl TaskRouter {
    pub fn new(registry: Arc<AgentRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            metrics: tokio::sync::RwLock::new(HashMap::new()),
            load_balancing_window: Duration::from_secs(60),
        })
    }

    pub async fn record_dispatch(&self, agent_id: &str, latency_ms: f32, success: bool) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent_id.to_string()).or_insert(AgentMetrics {
            success_rate: 1.0,
            avg_latency_ms: latency_ms,
            last_used: Utc::now(),
            cpu_util: 0.0,
            mem_util: 0.0,
        });
        // exponential moving average, consistent with a sliding-window success rate
        entry.success_rate = entry.success_rate * 0.8 + if success { 0.2 } else { 0.0 };
        entry.avg_latency_ms = entry.avg_latency_ms * 0.8 + latency_ms * 0.2;
        entry.last_used = Utc::now();
    }

    /// Decays `agent_id`'s success rate the way a failed dispatch would,
    /// without touching latency or `last_used` (§4.2: a failed health probe
    /// "decays its success-rate metric" — it isn't a dispatch).
    pub async fn record_health_failure(&self, agent_id: &str) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent_id.to_string()).or_insert(AgentMetrics {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            last_used: Utc::now(),
            cpu_util: 0.0,
            mem_util: 0.0,
        });
        entry.success_rate *= 0.8;
    }

    /// Picks the best agent for `method`, honoring an explicit `target` when
    /// the caller asked for one.
    pub async fn route(&self, method: &str, target: Option<&str>) -> Result<Agent> {
        if let Some(target) = target {
            let agent = self
                .registry
                .get(target)
                .await
                .ok_or_else(|| RoutingError::TargetNotFound(target.to_string()))?;
            if agent.status != AgentStatus::Online || !agent.advertises(method) {
                return Err(RoutingError::TargetNotEligible(target.to_string()));
            }
            return Ok(agent);
        }

        let candidates: Vec<Agent> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|a| a.status == AgentStatus::Online && a.advertises(method))
            .collect();

        if candidates.is_empty() {
            return Err(RoutingError::NoCapableAgent(method.to_string()));
        }

        let metrics = self.metrics.read().await;
        let mut best: Option<(Agent, f32, chrono::DateTime<Utc>)> = None;
        for agent in candidates {
            let m = metrics.get(&agent.id).copied();
            let score = self.score(&agent, method, m);
            let last_used = m.map(|m| m.last_used).unwrap_or_else(Utc::now);
            best = match best {
                None => Some((agent, score, last_used)),
                Some((best_agent, best_score, best_last_used)) => {
                    if score > best_score
                        || (score == best_score && last_used < best_last_used)
                    {
                        Some((agent, score, last_used))
                    } else {
                        Some((best_agent, best_score, best_last_used))
                    }
                }
            };
        }

        Ok(best.expect("candidates non-empty").0)
    }

    fn score(&self, agent: &Agent, method: &str, metrics: Option<AgentMetrics>) -> f32 {
        let Some(metrics) = metrics else {
            return 0.5;
        };

        let headroom = 1.0 - metrics.cpu_util.max(metrics.mem_util);
        let success = metrics.success_rate;
        let since_last_used = (Utc::now() - metrics.last_used)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let load_balance = (since_last_used.as_secs_f32()
            / self.load_balancing_window.as_secs_f32())
        .min(1.0);
        let latency = (1.0 - metrics.avg_latency_ms / 1000.0).max(0.0);
        let capability_match = agent.capability_match_fraction(method);

        0.30 * headroom.clamp(0.0, 1.0)
            + 0.25 * success.clamp(0.0, 1.0)
            + 0.20 * load_balance.clamp(0.0, 1.0)
            + 0.15 * latency.clamp(0.0, 1.0)
            + 0.10 * capability_match.clamp(0.0, 1.0)
    }
}
