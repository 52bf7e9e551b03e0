//! Task Queue (C3)
//!
//! Bounded FIFO of tasks keyed by id, with a secondary index for by-id
//! lookups and updates that don't disturb FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::orchestrator::task::{Task, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue full")]
    QueueFull,
    #[error("task not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

struct Inner {
    order: VecDeque<String>,
    index: std::collections::HashMap<String, Task>,
}

/// Bounded FIFO keyed by task id. All state lives behind one lock; `enqueue`
/// preserves order among equally-prioritized entries (§4.3).
pub struct TaskQueue {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: RwLock::new(Inner {
                order: VecDeque::new(),
                index: std::collections::HashMap::new(),
            }),
        })
    }

    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.order.len() >= self.capacity {
            return Err(QueueError::QueueFull);
        }
        inner.order.push_back(task.id.clone());
        inner.index.insert(task.id.clone(), task);
        Ok(())
    }

    /// Re-enqueue to the tail without creating a new id — used by the
    /// dispatch loop when dependencies aren't ready or a reservation is
    /// refused, to avoid busy-looping on an unready head (§4.3, §5).
    pub async fn requeue_tail(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.index.contains_key(&task.id) && inner.order.len() >= self.capacity {
            return Err(QueueError::QueueFull);
        }
        if !inner.order.contains(&task.id) {
            inner.order.push_back(task.id.clone());
        }
        inner.index.insert(task.id.clone(), task);
        Ok(())
    }

    /// Advances the head, sets `status = IN_PROGRESS` and `updated_at = now`.
    /// The task stays in the by-id index (only the FIFO order entry is
    /// consumed) so `getTask` keeps resolving it while it's in flight and
    /// after it reaches a terminal state.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.write().await;
        let id = inner.order.pop_front()?;
        let task = inner.index.get_mut(&id)?;
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        debug!(task_id = %id, "dequeued");
        Some(task.clone())
    }

    pub async fn peek(&self) -> Option<Task> {
        let inner = self.inner.read().await;
        let id = inner.order.front()?;
        inner.index.get(id).cloned()
    }

    pub async fn size(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.read().await.index.get(id).cloned()
    }

    /// Upserts by id into the index without re-enqueueing (§4.3).
    pub async fn update_task(&self, task: Task) {
        let mut inner = self.inner.write().await;
        inner.index.insert(task.id.clone(), task);
    }
}
