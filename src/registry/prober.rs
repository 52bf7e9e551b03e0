//! Background health prober
//!
//! Periodically GETs `{endpoint}/health` for every registered agent; a
//! non-OK response or transport error marks it OFFLINE, a successful
//! response restores ONLINE.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::router::TaskRouter;

use super::{AgentRegistry, AgentStatus};

pub fn spawn_health_prober(
    registry: Arc<AgentRegistry>,
    router: Arc<TaskRouter>,
    client: reqwest::Client,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            probe_all(&registry, &router, &client).await;
        }
    })
}

async fn probe_all(registry: &Arc<AgentRegistry>, router: &Arc<TaskRouter>, client: &reqwest::Client) {
    for agent in registry.list().await {
        let url = format!("{}/health", agent.endpoint.trim_end_matches('/'));
        let outcome = client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        let new_status = match outcome {
            Ok(resp) if resp.status().is_success() => AgentStatus::Online,
            Ok(resp) => {
                warn!(agent_id = %agent.id, status = %resp.status(), "health probe non-OK");
                router.record_health_failure(&agent.id).await;
                AgentStatus::Offline
            }
            Err(err) => {
                debug!(agent_id = %agent.id, %err, "health probe transport error");
                router.record_health_failure(&agent.id).await;
                AgentStatus::Offline
            }
        };

        if new_status != agent.status {
            let _ = registry.update_status(&agent.id, new_status).await;
        }
    }
}
