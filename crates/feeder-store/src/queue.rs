//! Typed facade over the durable queue.

use feeder_core::message::TaskMessage;
use feeder_core::Result;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{AtomicWrite, KvBackend, QueueMessage};

/// Push, lease and settle [`TaskMessage`]s.
///
/// Standalone pushes still go through an atomic commit so every enqueue path
/// shares the dedup and durability semantics.
#[derive(Clone)]
pub struct TaskQueue {
    backend: Arc<dyn KvBackend>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn push(&self, message: TaskMessage) -> Result<()> {
        self.backend
            .commit(AtomicWrite::new().enqueue(message))
            .await
    }

    pub async fn push_delayed(&self, message: TaskMessage, delay: Duration) -> Result<()> {
        self.backend
            .commit(AtomicWrite::new().enqueue_delayed(message, delay))
            .await
    }

    pub async fn dequeue(&self) -> Result<Option<QueueMessage>> {
        self.backend.queue_dequeue().await
    }

    pub async fn complete(&self, id: Uuid) -> Result<()> {
        self.backend.queue_complete(id).await
    }

    /// Settle a failed delivery: release with the message's next backoff
    /// delay, or bury it once the budget is spent. Returns true when the
    /// message was buried.
    pub async fn retry_or_bury(&self, message: &QueueMessage, error: &str) -> Result<bool> {
        match message.next_backoff() {
            Some(delay) => {
                self.backend.queue_release(message.id, delay, error).await?;
                Ok(false)
            }
            None => {
                self.backend.queue_bury(message.id, error).await?;
                Ok(true)
            }
        }
    }

    pub async fn release_stale(&self, visibility: Duration) -> Result<u64> {
        self.backend.queue_release_stale(visibility).await
    }

    pub async fn pending_len(&self) -> Result<u64> {
        self.backend.queue_pending_len().await
    }
}
