//! Resource Manager (C1)
//!
//! Tracks sampled CPU/memory usage, admits or rejects reservations against
//! configured limits, and emits level-triggered alerts when cumulative
//! reservations cross warning/critical thresholds.

mod sampler;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::config::{MemoryTiers, ResourceLimitsConfig};

pub use sampler::MeasuredUsage;

/// Resource manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),
}

pub type Result<T> = std::result::Result<T, ResourceError>;

/// `{memoryBytes, cpuPercent, timeoutMs}` — what a task or workflow step
/// needs reserved for its lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequirement {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub timeout_ms: u64,
}

impl ResourceRequirement {
    pub const fn new(memory_bytes: u64, cpu_percent: f32, timeout_ms: u64) -> Self {
        Self {
            memory_bytes,
            cpu_percent,
            timeout_ms,
        }
    }
}

/// Named tiers used by the orchestrator's `derive resourceRequirement from
/// method` step (§4.5). Memory sizes come from `Settings.memory_tiers`
/// (§6's configurable "scheduler memory-estimate tiers"); cpu/timeout
/// aren't part of that config surface so they stay fixed per tier.
pub mod tiers {
    use super::{MemoryTiers, ResourceRequirement};

    /// Used only where no configured tiers are available (internal test
    /// helpers); production call sites go through `small`/`medium`/`large`.
    pub const SMALL: ResourceRequirement = ResourceRequirement::new(256 << 20, 10.0, 30_000);

    pub fn small(tiers: &MemoryTiers) -> ResourceRequirement {
        ResourceRequirement::new(tiers.small_bytes, 10.0, 30_000)
    }

    pub fn medium(tiers: &MemoryTiers) -> ResourceRequirement {
        ResourceRequirement::new(tiers.medium_bytes, 25.0, 60_000)
    }

    pub fn large(tiers: &MemoryTiers) -> ResourceRequirement {
        ResourceRequirement::new(tiers.large_bytes, 50.0, 300_000)
    }

    pub fn xlarge(tiers: &MemoryTiers) -> ResourceRequirement {
        ResourceRequirement::new(tiers.xlarge_bytes, 75.0, 600_000)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub process_usage: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub usage: f32,
    pub load_avg: f32,
    pub process_usage: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AvailableResources {
    pub memory: u64,
    pub cpu: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UtilizationPercentages {
    pub memory: f32,
    pub cpu: f32,
}

/// Immutable point-in-time view returned by [`ResourceManager::snapshot`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory: MemorySnapshot,
    pub cpu: CpuSnapshot,
    pub available_resources: AvailableResources,
    pub utilization_percentages: UtilizationPercentages,
}

/// Resource alert level, level-triggered on threshold crossings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// `memory.max`, `memory.warning`, `cpu.maxUsage`, `cpu.warning`.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_max: u64,
    pub memory_warning: u64,
    pub cpu_max: f32,
    pub cpu_warning: f32,
}

impl From<&ResourceLimitsConfig> for ResourceLimits {
    fn from(c: &ResourceLimitsConfig) -> Self {
        Self {
            memory_max: c.memory_max_bytes,
            memory_warning: c.memory_warning_bytes,
            cpu_max: c.cpu_max_percent,
            cpu_warning: c.cpu_warning_percent,
        }
    }
}

/// no alert level yet emitted for a resource dimension
const ALERT_NONE: u8 = 0;
const ALERT_WARNING: u8 = 1;
const ALERT_CRITICAL: u8 = 2;

/// Tracks reservations and sampled usage; admits or refuses new work.
///
/// The reservation table is the one piece of exclusively-owned mutable state
/// in this component (§5): every call takes the same lock, callers only ever
/// see it through [`reserve`](Self::reserve)/[`release`](Self::release)/
/// [`snapshot`](Self::snapshot).
pub struct ResourceManager {
    limits: ResourceLimits,
    reservations: RwLock<HashMap<String, ResourceRequirement>>,
    measured: Arc<RwLock<MeasuredUsage>>,
    memory_alert_level: AtomicU8,
    cpu_alert_level: AtomicU8,
    alerts: broadcast::Sender<(AlertLevel, &'static str)>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits) -> Arc<Self> {
        let (alerts, _rx) = broadcast::channel(64);
        Arc::new(Self {
            limits,
            reservations: RwLock::new(HashMap::new()),
            measured: Arc::new(RwLock::new(MeasuredUsage::baseline(limits.memory_max))),
            memory_alert_level: AtomicU8::new(ALERT_NONE),
            cpu_alert_level: AtomicU8::new(ALERT_NONE),
            alerts,
        })
    }

    /// Subscribe to `warning`/`critical` alerts (consumed by the
    /// orchestrator's resource-critical hook and the workflow engine's pause
    /// reaction).
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<(AlertLevel, &'static str)> {
        self.alerts.subscribe()
    }

    /// Spawn the ~1s background sampler. Returns the join handle so shutdown
    /// can drain it; sampling errors are logged and leave the last snapshot
    /// in place (§4.1 failure semantics).
    pub fn spawn_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let measured = self.measured.clone();
        tokio::spawn(sampler::run(measured))
    }

    async fn reserved_totals(
        reservations: &HashMap<String, ResourceRequirement>,
    ) -> (u64, f32) {
        reservations.values().fold((0u64, 0f32), |(m, c), r| {
            (m + r.memory_bytes, c + r.cpu_percent)
        })
    }

    /// `(free_memory ≥ req.memory) ∧ (free_cpu ≥ req.cpu) ∧ (reserved+req ≤
    /// limits)`. "Free" already nets out current reservations against the
    /// measured baseline.
    pub async fn can_handle(&self, req: &ResourceRequirement) -> bool {
        let reservations = self.reservations.read().await;
        let (reserved_mem, reserved_cpu) = Self::reserved_totals(&reservations).await;
        drop(reservations);

        let measured = self.measured.read().await;
        let free_memory = self
            .limits
            .memory_max
            .saturating_sub(reserved_mem)
            .saturating_sub(measured.memory_used);
        let free_cpu = (self.limits.cpu_max - reserved_cpu - measured.cpu_used).max(0.0);

        free_memory >= req.memory_bytes
            && free_cpu >= req.cpu_percent
            && reserved_mem + req.memory_bytes <= self.limits.memory_max
            && reserved_cpu + req.cpu_percent <= self.limits.cpu_max
    }

    /// Atomic test-and-insert. Emits an alert when the crossing is new.
    pub async fn reserve(&self, task_id: impl Into<String>, req: ResourceRequirement) -> bool {
        let task_id = task_id.into();
        let mut reservations = self.reservations.write().await;
        let (reserved_mem, reserved_cpu) = Self::reserved_totals(&reservations).await;

        let measured = self.measured.read().await;
        let free_memory = self
            .limits
            .memory_max
            .saturating_sub(reserved_mem)
            .saturating_sub(measured.memory_used);
        let free_cpu = (self.limits.cpu_max - reserved_cpu - measured.cpu_used).max(0.0);
        drop(measured);

        let admit = free_memory >= req.memory_bytes
            && free_cpu >= req.cpu_percent
            && reserved_mem + req.memory_bytes <= self.limits.memory_max
            && reserved_cpu + req.cpu_percent <= self.limits.cpu_max;

        if !admit {
            debug!(task_id, "reservation refused: insufficient headroom");
            return false;
        }

        let new_mem = reserved_mem + req.memory_bytes;
        let new_cpu = reserved_cpu + req.cpu_percent;
        reservations.insert(task_id.clone(), req);
        drop(reservations);

        self.maybe_alert_memory(new_mem);
        self.maybe_alert_cpu(new_cpu);

        debug!(task_id, ?req, "reservation admitted");
        true
    }

    fn maybe_alert_memory(&self, reserved_mem: u64) {
        let level = if reserved_mem >= self.limits.memory_max {
            ALERT_CRITICAL
        } else if reserved_mem >= self.limits.memory_warning {
            ALERT_WARNING
        } else {
            ALERT_NONE
        };
        let prev = self.memory_alert_level.swap(level, Ordering::SeqCst);
        if level > prev && level != ALERT_NONE {
            let alert_level = if level == ALERT_CRITICAL {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            warn!(?alert_level, "memory reservation crossed threshold");
            let _ = self.alerts.send((alert_level, "memory"));
        } else if level < prev {
            self.memory_alert_level.store(level, Ordering::SeqCst);
        }
    }

    fn maybe_alert_cpu(&self, reserved_cpu: f32) {
        let level = if reserved_cpu >= self.limits.cpu_max {
            ALERT_CRITICAL
        } else if reserved_cpu >= self.limits.cpu_warning {
            ALERT_WARNING
        } else {
            ALERT_NONE
        };
        let prev = self.cpu_alert_level.swap(level, Ordering::SeqCst);
        if level > prev && level != ALERT_NONE {
            let alert_level = if level == ALERT_CRITICAL {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            warn!(?alert_level, "cpu reservation crossed threshold");
            let _ = self.alerts.send((alert_level, "cpu"));
        } else if level < prev {
            self.cpu_alert_level.store(level, Ordering::SeqCst);
        }
    }

    /// Idempotent: releasing an unknown or already-released id is a no-op.
    pub async fn release(&self, task_id: &str) {
        let mut reservations = self.reservations.write().await;
        if reservations.remove(task_id).is_some() {
            debug!(task_id, "reservation released");
        }
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        let reservations = self.reservations.read().await;
        let (reserved_mem, reserved_cpu) = Self::reserved_totals(&reservations).await;
        drop(reservations);

        let measured = self.measured.read().await;
        let used = measured.memory_used + reserved_mem;
        let free = self.limits.memory_max.saturating_sub(used);
        let cpu_used = measured.cpu_used + reserved_cpu;

        ResourceSnapshot {
            memory: MemorySnapshot {
                total: self.limits.memory_max,
                used,
                free,
                process_usage: measured.process_memory,
            },
            cpu: CpuSnapshot {
                usage: cpu_used,
                load_avg: measured.load_avg,
                process_usage: measured.process_cpu,
            },
            available_resources: AvailableResources {
                memory: free,
                cpu: (self.limits.cpu_max - cpu_used).max(0.0),
            },
            utilization_percentages: UtilizationPercentages {
                memory: (used as f32 / self.limits.memory_max as f32) * 100.0,
                cpu: (cpu_used / self.limits.cpu_max) * 100.0,
            },
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ResourceManager> {
        ResourceManager::new(ResourceLimits {
            memory_max: 1 << 30,
            memory_warning: (1 << 30) * 3 / 4,
            cpu_max: 100.0,
            cpu_warning: 75.0,
        })
    }

    #[tokio::test]
    async fn reserve_then_release_is_idempotent() {
        let mgr = manager();
        let req = ResourceRequirement::new(100 << 20, 10.0, 1000);
        assert!(mgr.reserve("t1", req).await);
        mgr.release("t1").await;
        mgr.release("t1").await; // idempotent
        assert!(mgr.can_handle(&req).await);
    }

    #[tokio::test]
    async fn refuses_oversized_reservation() {
        let mgr = manager();
        let req = ResourceRequirement::new(2 << 30, 10.0, 1000);
        assert!(!mgr.can_handle(&req).await);
        assert!(!mgr.reserve("t1", req).await);
    }

    #[tokio::test]
    async fn double_reservation_of_same_task_id_is_additive_not_duplicated() {
        let mgr = manager();
        let req = ResourceRequirement::new(400 << 20, 20.0, 1000);
        assert!(mgr.reserve("t1", req).await);
        // re-reserving the same id overwrites rather than stacking
        assert!(mgr.reserve("t1", req).await);
        let snap = mgr.snapshot().await;
        assert!(snap.memory.used <= 400 << 20);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Admitting an arbitrary sequence of same-size reservations must
            // never push total reserved memory past the configured limit,
            // regardless of how many requests arrive or in what order.
            #[test]
            fn reserved_memory_never_exceeds_limit(
                memory_each in 1u64..(64 << 20),
                count in 0usize..32,
            ) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let mgr = manager();
                    let req = ResourceRequirement::new(memory_each, 1.0, 1000);
                    for i in 0..count {
                        mgr.reserve(format!("t{i}"), req).await;
                    }
                    let snap = mgr.snapshot().await;
                    prop_assert!(snap.memory.used <= mgr.limits().memory_max);
                    Ok(())
                })?;
            }

            // release() is a no-op for any id that was never reserved.
            #[test]
            fn releasing_unknown_id_never_changes_snapshot(id in "[a-z]{1,12}") {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let mgr = manager();
                    let before = mgr.snapshot().await.memory.used;
                    mgr.release(&id).await;
                    let after = mgr.snapshot().await.memory.used;
                    prop_assert_eq!(before, after);
                    Ok(())
                })?;
            }
        }
    }
}
