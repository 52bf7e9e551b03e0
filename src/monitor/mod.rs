//! Monitor / Metrics (C8)
//!
//! Periodically samples C1's [`ResourceSnapshot`], derives a coarse health
//! status from warning/critical thresholds, and keeps a bounded history ring
//! for "query since t" lookups. Grounded on
//! `axon::monitoring::metrics::MetricsCollector`'s atomic-counter snapshot
//! pattern, adapted from task-completion counters to resource-health
//! sampling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::resource::{ResourceManager, ResourceSnapshot};

const HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One historical sample: the C1 snapshot plus the derived status (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub snapshot: ResourceSnapshot,
}

/// Samples C1 on an interval and retains the last [`HISTORY_CAPACITY`]
/// records. The ring itself is the only shared mutable state; every other
/// method only reads it.
pub struct Monitor {
    resource_manager: Arc<ResourceManager>,
    history: RwLock<VecDeque<HealthRecord>>,
}

impl Monitor {
    pub fn new(resource_manager: Arc<ResourceManager>) -> Arc<Self> {
        Arc::new(Self {
            resource_manager,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        })
    }

    /// Derive {healthy, degraded, unhealthy} from two thresholds per
    /// resource (§4.8): unhealthy if either dimension is at/over its max,
    /// degraded if either is at/over its warning line, healthy otherwise.
    pub fn classify(snapshot: &ResourceSnapshot, limits: &crate::resource::ResourceLimits) -> HealthStatus {
        let memory_critical = snapshot.memory.used >= limits.memory_max;
        let cpu_critical = snapshot.cpu.usage >= limits.cpu_max;
        if memory_critical || cpu_critical {
            return HealthStatus::Unhealthy;
        }

        let memory_warning = snapshot.memory.used >= limits.memory_warning;
        let cpu_warning = snapshot.cpu.usage >= limits.cpu_warning;
        if memory_warning || cpu_warning {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }

    async fn sample_once(&self) {
        let snapshot = self.resource_manager.snapshot().await;
        let status = Self::classify(&snapshot, &self.resource_manager.limits());
        let record = HealthRecord {
            timestamp: Utc::now(),
            status,
            snapshot,
        };

        let mut history = self.history.write().await;
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn spawn_sampler(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.sample_once().await;
            }
        })
    }

    pub async fn latest(&self) -> Option<HealthRecord> {
        self.history.read().await.back().cloned()
    }

    /// All retained records at or after `since` (§4.8 "query history since
    /// t"), oldest first.
    pub async fn history_since(&self, since: DateTime<Utc>) -> Vec<HealthRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect()
    }
}
