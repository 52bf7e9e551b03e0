//! Event Bus (C7)
//!
//! Topic-prefixed pub/sub hub grounded on
//! `axon::coordination::message_bus::MessageBus`'s
//! `tokio::sync::broadcast`-per-topic pattern, generalized to a single
//! fixed-schema event type with an "all topics" subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// A lifecycle event published by the orchestrator or workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// e.g. `task:completed`, `workflow:step:failed`.
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: Option<String>,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            workflow_id: None,
            task_id: None,
            step_id: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Topic prefix: the part of `event_type` before the first `:`.
    fn topic(&self) -> &str {
        self.event_type.split(':').next().unwrap_or(&self.event_type)
    }
}

/// Pub/sub hub. Delivery is best-effort, at-most-once per subscriber; a
/// subscriber that falls behind its bounded buffer drops the oldest events
/// (`broadcast::Receiver` semantics) rather than blocking publication.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// A live subscription, optionally filtered to a set of topics.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    topics: Vec<String>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Blocks until the next event matching this subscription's topics
    /// arrives, or returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.topics.is_empty()
                        || self.topics.iter().any(|t| t == event.topic())
                    {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!(skipped = n, "subscriber lagged, events dropped");
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity);
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `topics` empty means "subscribe to everything".
    pub fn subscribe(&self, topics: Vec<String>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topics,
            dropped: self.dropped.clone(),
        }
    }

    pub fn publish(&self, event: Event) {
        // send() only errors when there are no subscribers; that's fine, the
        // event simply has no audience yet.
        let _ = self.sender.send(event);
    }

    /// Events a subscriber never saw because it fell behind its bounded
    /// buffer (§4.7 "slow subscribers may drop events past a per-subscriber
    /// bounded buffer"), summed across every subscription this bus has
    /// handed out.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
