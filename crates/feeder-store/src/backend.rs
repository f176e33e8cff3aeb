//! Backend contract shared by the Postgres and in-memory stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feeder_core::message::TaskMessage;
use feeder_core::Result;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::key::KvKey;

/// A stored value together with its CAS version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    pub value: Value,
    pub version: i64,
}

/// One mutation inside an atomic commit.
#[derive(Debug, Clone)]
pub enum KvOp {
    /// Insert; fails with `Error::Duplicate` when the key already exists.
    Create { key: KvKey, value: Value },
    /// Unconditional upsert.
    Put { key: KvKey, value: Value },
    /// Compare-and-set: applies only when the stored version matches.
    Update {
        key: KvKey,
        value: Value,
        expected_version: i64,
    },
    /// Unconditional delete; deleting an absent key is not an error.
    Delete { key: KvKey },
    /// Assert a key's version (`None` asserts absence) without writing it.
    Check {
        key: KvKey,
        expected_version: Option<i64>,
    },
}

/// A queue message to be inserted with the commit.
#[derive(Debug, Clone)]
pub struct Enqueue {
    pub message: TaskMessage,
    pub delay: Duration,
    /// Overrides the message type's default attempt budget when set.
    pub max_attempts: Option<u32>,
}

impl Enqueue {
    pub fn immediate(message: TaskMessage) -> Self {
        Self {
            message,
            delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    pub fn delayed(message: TaskMessage, delay: Duration) -> Self {
        Self {
            message,
            delay,
            max_attempts: None,
        }
    }

    /// Cap delivery at one initial attempt plus `retries` retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_attempts = Some(retries.saturating_add(1));
        self
    }

    /// The attempt budget this message will be stored with.
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts
            .unwrap_or_else(|| self.message.max_attempts())
    }
}

/// An ordered batch of mutations plus queue inserts, committed atomically.
///
/// Either every op applies and every message is durably queued, or nothing
/// is. `Create`/`Update`/`Check` failures abort the whole batch.
#[derive(Debug, Clone, Default)]
pub struct AtomicWrite {
    pub ops: Vec<KvOp>,
    pub enqueues: Vec<Enqueue>,
}

impl AtomicWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, key: KvKey, value: Value) -> Self {
        self.ops.push(KvOp::Create { key, value });
        self
    }

    pub fn put(mut self, key: KvKey, value: Value) -> Self {
        self.ops.push(KvOp::Put { key, value });
        self
    }

    pub fn update(mut self, key: KvKey, value: Value, expected_version: i64) -> Self {
        self.ops.push(KvOp::Update {
            key,
            value,
            expected_version,
        });
        self
    }

    pub fn delete(mut self, key: KvKey) -> Self {
        self.ops.push(KvOp::Delete { key });
        self
    }

    pub fn check(mut self, key: KvKey, expected_version: Option<i64>) -> Self {
        self.ops.push(KvOp::Check {
            key,
            expected_version,
        });
        self
    }

    pub fn enqueue(mut self, message: TaskMessage) -> Self {
        self.enqueues.push(Enqueue::immediate(message));
        self
    }

    pub fn enqueue_delayed(mut self, message: TaskMessage, delay: Duration) -> Self {
        self.enqueues.push(Enqueue::delayed(message, delay));
        self
    }

    pub fn enqueue_with(mut self, enqueue: Enqueue) -> Self {
        self.enqueues.push(enqueue);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.enqueues.is_empty()
    }
}

/// A message leased from the queue for one delivery attempt.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: Uuid,
    pub payload: TaskMessage,
    /// Delivery attempts so far, counting this one
    pub attempts: u32,
    pub max_attempts: u32,
    /// Per-attempt retry delays in seconds, captured at enqueue time
    pub backoff_secs: Vec<u64>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    /// The delay before the next delivery attempt, or `None` when the retry
    /// budget is spent and the message must be buried.
    pub fn next_backoff(&self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let idx = (self.attempts.saturating_sub(1)) as usize;
        let secs = self
            .backoff_secs
            .get(idx)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(60);
        Some(Duration::from_secs(secs))
    }
}

/// The persistence contract: typed KV rows with versions plus the durable
/// queue, both served by one backend so enqueues can share a transaction
/// with row mutations.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<VersionedValue>>;

    /// Every `(key, value)` whose key extends `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &KvKey) -> Result<Vec<(String, VersionedValue)>>;

    /// Apply an atomic write batch. All-or-nothing.
    async fn commit(&self, write: AtomicWrite) -> Result<()>;

    /// Lease the next available message, bumping its attempt counter.
    async fn queue_dequeue(&self) -> Result<Option<QueueMessage>>;

    /// Mark a leased message as done.
    async fn queue_complete(&self, id: Uuid) -> Result<()>;

    /// Return a leased message to the pending state after a delay.
    async fn queue_release(&self, id: Uuid, delay: Duration, error: &str) -> Result<()>;

    /// Move a message to the dead-letter state.
    async fn queue_bury(&self, id: Uuid, error: &str) -> Result<()>;

    /// Re-open leases older than the visibility timeout.
    async fn queue_release_stale(&self, visibility: Duration) -> Result<u64>;

    /// Number of messages currently waiting.
    async fn queue_pending_len(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TaskMessage {
        TaskMessage::Renew {
            external_subscription_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn next_backoff_walks_the_schedule() {
        let mut msg = QueueMessage {
            id: Uuid::new_v4(),
            payload: message(),
            attempts: 1,
            max_attempts: 5,
            backoff_secs: vec![1, 10, 60, 600],
            enqueued_at: Utc::now(),
        };
        assert_eq!(msg.next_backoff(), Some(Duration::from_secs(1)));
        msg.attempts = 4;
        assert_eq!(msg.next_backoff(), Some(Duration::from_secs(600)));
        msg.attempts = 5;
        assert_eq!(msg.next_backoff(), None);
    }

    #[test]
    fn retries_override_sets_budget() {
        let enqueue = Enqueue::immediate(message());
        // Renew carries a 2-delay schedule by default
        assert_eq!(enqueue.attempt_budget(), 3);
        let capped = enqueue.with_retries(1);
        assert_eq!(capped.max_attempts, Some(2));
        assert_eq!(capped.attempt_budget(), 2);
    }

    #[test]
    fn empty_schedule_falls_back() {
        let msg = QueueMessage {
            id: Uuid::new_v4(),
            payload: message(),
            attempts: 1,
            max_attempts: 3,
            backoff_secs: vec![],
            enqueued_at: Utc::now(),
        };
        assert_eq!(msg.next_backoff(), Some(Duration::from_secs(60)));
    }
}
