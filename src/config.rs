//! Configuration loading
//!
//! Loads a [`Settings`] from an optional TOML file merged with `LOOM_`-prefixed
//! environment overrides, using the `config` crate the way most services in
//! this stack assemble layered configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler memory-estimate tiers (§6), used by
/// `resource::tiers::{small,medium,large,xlarge}` to size a task's
/// `resourceRequirement` from its method name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryTiers {
    pub small_bytes: u64,
    pub medium_bytes: u64,
    pub large_bytes: u64,
    pub xlarge_bytes: u64,
}

impl Default for MemoryTiers {
    fn default() -> Self {
        Self {
            small_bytes: 256 * 1024 * 1024,
            medium_bytes: 512 * 1024 * 1024,
            large_bytes: 1024 * 1024 * 1024,
            xlarge_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    pub memory_max_bytes: u64,
    pub memory_warning_bytes: u64,
    pub cpu_max_percent: f32,
    pub cpu_warning_percent: f32,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            memory_max_bytes: 8 * 1024 * 1024 * 1024,
            memory_warning_bytes: 6 * 1024 * 1024 * 1024,
            cpu_max_percent: 90.0,
            cpu_warning_percent: 70.0,
        }
    }
}

/// Top-level orchestrator settings (§6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Bound on simultaneous dispatch operations. `1` reproduces the source's
    /// serial `BasicOrchestrator`.
    pub max_concurrent_tasks: usize,

    pub retry_attempts: u32,
    pub retry_delay_ms: u64,

    pub max_concurrent_workflows: usize,
    pub cache_timeout_ms: u64,

    pub resource_limits: ResourceLimitsConfig,
    pub memory_tiers: MemoryTiers,

    /// Address the HTTP surface binds to.
    pub bind_address: String,

    /// Interval between agent registry health probes.
    pub health_probe_interval_ms: u64,

    /// Per-subscriber bounded buffer size for the event bus.
    pub event_bus_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_concurrent_workflows: 10,
            cache_timeout_ms: 30 * 60 * 1000,
            resource_limits: ResourceLimitsConfig::default(),
            memory_tiers: MemoryTiers::default(),
            bind_address: "127.0.0.1:8080".to_string(),
            health_probe_interval_ms: 15_000,
            event_bus_capacity: 1024,
        }
    }
}

impl Settings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    /// Load settings from an optional TOML file, overlaid with `LOOM_*`
    /// environment variables (e.g. `LOOM_MAX_CONCURRENT_TASKS=4`).
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("LOOM")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }
}
