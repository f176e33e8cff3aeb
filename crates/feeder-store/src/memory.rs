//! In-memory backend.
//!
//! Same semantics as the Postgres backend, held in process memory. Selected
//! with `database.backend = "memory"` for development, and the substrate for
//! most of the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feeder_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{AtomicWrite, KvBackend, KvOp, QueueMessage, VersionedValue};
use crate::key::KvKey;

#[derive(Debug, Clone, PartialEq, Eq)]
enum MessageStatus {
    Pending,
    Reserved,
    Completed,
    Dead,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    status: MessageStatus,
    attempts: u32,
    max_attempts: u32,
    backoff_secs: Vec<u64>,
    last_error: Option<String>,
    available_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<String, VersionedValue>,
    queue: Vec<StoredMessage>,
}

/// Mutex-guarded map store with queue semantics matching Postgres.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(inner: &Inner, write: &AtomicWrite) -> Result<()> {
        for op in &write.ops {
            match op {
                KvOp::Create { key, .. } => {
                    if inner.rows.contains_key(key.as_str()) {
                        return Err(Error::duplicate("kv_entry", key.to_string()));
                    }
                }
                KvOp::Update {
                    key,
                    expected_version,
                    ..
                } => match inner.rows.get(key.as_str()) {
                    Some(existing) if existing.version == *expected_version => {}
                    _ => return Err(Error::conflict(key.to_string())),
                },
                KvOp::Check {
                    key,
                    expected_version,
                } => {
                    let actual = inner.rows.get(key.as_str()).map(|v| v.version);
                    if actual != *expected_version {
                        return Err(Error::conflict(key.to_string()));
                    }
                }
                KvOp::Put { .. } | KvOp::Delete { .. } => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &KvKey) -> Result<Option<VersionedValue>> {
        Ok(self.inner.lock().rows.get(key.as_str()).cloned())
    }

    async fn list_prefix(&self, prefix: &KvKey) -> Result<Vec<(String, VersionedValue)>> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .range(prefix.as_str().to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(&self, write: AtomicWrite) -> Result<()> {
        let mut inner = self.inner.lock();

        // All-or-nothing: check every precondition and serialize every
        // payload before touching state.
        Self::validate(&inner, &write)?;
        let mut pending_messages = Vec::with_capacity(write.enqueues.len());
        for enqueue in &write.enqueues {
            pending_messages.push((
                serde_json::to_value(&enqueue.message)?,
                enqueue.message.dedup_key(),
                enqueue.message.backoff_schedule().to_vec(),
                enqueue.attempt_budget(),
                enqueue.delay,
            ));
        }

        for op in write.ops {
            match op {
                KvOp::Create { key, value } | KvOp::Put { key, value } => {
                    let version = inner
                        .rows
                        .get(key.as_str())
                        .map(|existing| existing.version + 1)
                        .unwrap_or(1);
                    inner
                        .rows
                        .insert(key.into_string(), VersionedValue { value, version });
                }
                KvOp::Update { key, value, .. } => {
                    let version = inner
                        .rows
                        .get(key.as_str())
                        .map(|existing| existing.version + 1)
                        .unwrap_or(1);
                    inner
                        .rows
                        .insert(key.into_string(), VersionedValue { value, version });
                }
                KvOp::Delete { key } => {
                    inner.rows.remove(key.as_str());
                }
                KvOp::Check { .. } => {}
            }
        }

        let now = Utc::now();
        for (payload, dedup_key, backoff, max_attempts, delay) in pending_messages {
            if let Some(dedup) = &dedup_key {
                let already_queued = inner.queue.iter().any(|m| {
                    matches!(m.status, MessageStatus::Pending | MessageStatus::Reserved)
                        && m.dedup_key.as_deref() == Some(dedup)
                });
                if already_queued {
                    continue;
                }
            }
            inner.queue.push(StoredMessage {
                id: Uuid::new_v4(),
                payload,
                dedup_key,
                status: MessageStatus::Pending,
                attempts: 0,
                max_attempts,
                backoff_secs: backoff,
                last_error: None,
                available_at: now + ChronoDuration::milliseconds(delay.as_millis() as i64),
                reserved_at: None,
                created_at: now,
            });
        }

        Ok(())
    }

    async fn queue_dequeue(&self) -> Result<Option<QueueMessage>> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        let candidate = inner
            .queue
            .iter_mut()
            .filter(|m| m.status == MessageStatus::Pending && m.available_at <= now)
            .min_by_key(|m| m.available_at);

        let Some(message) = candidate else {
            return Ok(None);
        };

        message.status = MessageStatus::Reserved;
        message.reserved_at = Some(now);
        message.attempts += 1;

        let payload = serde_json::from_value(message.payload.clone())?;
        Ok(Some(QueueMessage {
            id: message.id,
            payload,
            attempts: message.attempts,
            max_attempts: message.max_attempts,
            backoff_secs: message.backoff_secs.clone(),
            enqueued_at: message.created_at,
        }))
    }

    async fn queue_complete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.queue.iter_mut().find(|m| m.id == id) {
            message.status = MessageStatus::Completed;
            message.reserved_at = None;
        }
        Ok(())
    }

    async fn queue_release(&self, id: Uuid, delay: Duration, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.queue.iter_mut().find(|m| m.id == id) {
            message.status = MessageStatus::Pending;
            message.reserved_at = None;
            message.last_error = Some(error.to_string());
            message.available_at =
                Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
        }
        Ok(())
    }

    async fn queue_bury(&self, id: Uuid, error: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(message) = inner.queue.iter_mut().find(|m| m.id == id) {
            message.status = MessageStatus::Dead;
            message.reserved_at = None;
            message.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn queue_release_stale(&self, visibility: Duration) -> Result<u64> {
        let mut inner = self.inner.lock();
        let threshold = Utc::now() - ChronoDuration::milliseconds(visibility.as_millis() as i64);
        let mut released = 0;
        for message in inner.queue.iter_mut() {
            if message.status == MessageStatus::Reserved
                && message.reserved_at.map(|t| t < threshold).unwrap_or(true)
            {
                message.status = MessageStatus::Pending;
                message.reserved_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn queue_pending_len(&self) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .queue
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::keys;
    use feeder_core::message::TaskMessage;
    use serde_json::json;

    fn key(n: &str) -> KvKey {
        KvKey::new(["test", n])
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().create(key("a"), json!({"x": 1})))
            .await
            .unwrap();
        let row = backend.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(row.value, json!({"x": 1}));
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn create_twice_is_duplicate() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().create(key("a"), json!(1)))
            .await
            .unwrap();
        let err = backend
            .commit(AtomicWrite::new().create(key("a"), json!(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));
        // Original row untouched
        let row = backend.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(row.value, json!(1));
    }

    #[tokio::test]
    async fn update_requires_matching_version() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().create(key("a"), json!(1)))
            .await
            .unwrap();

        backend
            .commit(AtomicWrite::new().update(key("a"), json!(2), 1))
            .await
            .unwrap();

        let err = backend
            .commit(AtomicWrite::new().update(key("a"), json!(3), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let row = backend.get(&key("a")).await.unwrap().unwrap();
        assert_eq!(row.value, json!(2));
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn failed_batch_applies_nothing() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().create(key("a"), json!(1)))
            .await
            .unwrap();

        // Second op fails, so the first must not apply either
        let err = backend
            .commit(
                AtomicWrite::new()
                    .put(key("b"), json!(2))
                    .create(key("a"), json!(3)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));
        assert!(backend.get(&key("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn check_asserts_absence() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().check(key("missing"), None))
            .await
            .unwrap();

        backend
            .commit(AtomicWrite::new().create(key("present"), json!(1)))
            .await
            .unwrap();
        let err = backend
            .commit(AtomicWrite::new().check(key("present"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn list_prefix_is_bounded() {
        let backend = MemoryBackend::new();
        let feed_a = Uuid::new_v4();
        let feed_b = Uuid::new_v4();
        backend
            .commit(
                AtomicWrite::new()
                    .put(keys::feed_item_by_guid(feed_a, "g1"), json!("a1"))
                    .put(keys::feed_item_by_guid(feed_a, "g2"), json!("a2"))
                    .put(keys::feed_item_by_guid(feed_b, "g1"), json!("b1")),
            )
            .await
            .unwrap();

        let listed = backend
            .list_prefix(&keys::feed_items_for_feed(feed_a))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn enqueue_commits_with_rows() {
        let backend = MemoryBackend::new();
        let feed_id = Uuid::new_v4();
        backend
            .commit(
                AtomicWrite::new()
                    .create(keys::feed(feed_id), json!({"url": "x"}))
                    .enqueue(TaskMessage::PollFeed { feed_id }),
            )
            .await
            .unwrap();
        assert_eq!(backend.queue_pending_len().await.unwrap(), 1);

        // Failed commits must not leak their enqueues
        let err = backend
            .commit(
                AtomicWrite::new()
                    .create(keys::feed(feed_id), json!({"url": "x"}))
                    .enqueue(TaskMessage::PollFeed { feed_id }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));
        assert_eq!(backend.queue_pending_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_polls_deduplicate_per_feed() {
        let backend = MemoryBackend::new();
        let feed_id = Uuid::new_v4();
        for _ in 0..3 {
            backend
                .commit(AtomicWrite::new().enqueue(TaskMessage::PollFeed { feed_id }))
                .await
                .unwrap();
        }
        assert_eq!(backend.queue_pending_len().await.unwrap(), 1);

        // An in-flight poll still blocks a new one for the same feed
        let leased = backend.queue_dequeue().await.unwrap().unwrap();
        backend
            .commit(AtomicWrite::new().enqueue(TaskMessage::PollFeed { feed_id }))
            .await
            .unwrap();
        assert_eq!(backend.queue_pending_len().await.unwrap(), 0);

        // Settling the lease frees the key
        backend.queue_complete(leased.id).await.unwrap();
        backend
            .commit(AtomicWrite::new().enqueue(TaskMessage::PollFeed { feed_id }))
            .await
            .unwrap();
        assert_eq!(backend.queue_pending_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn budget_override_is_stored() {
        use crate::backend::Enqueue;

        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().enqueue_with(
                Enqueue::immediate(TaskMessage::Renew {
                    external_subscription_id: Uuid::new_v4(),
                })
                .with_retries(1),
            ))
            .await
            .unwrap();

        let leased = backend.queue_dequeue().await.unwrap().unwrap();
        assert_eq!(leased.max_attempts, 2);
    }

    #[tokio::test]
    async fn delayed_messages_stay_invisible() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().enqueue_delayed(
                TaskMessage::Renew {
                    external_subscription_id: Uuid::new_v4(),
                },
                Duration::from_secs(3600),
            ))
            .await
            .unwrap();
        assert!(backend.queue_dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_and_bury_lifecycle() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().enqueue(TaskMessage::Renew {
                external_subscription_id: Uuid::new_v4(),
            }))
            .await
            .unwrap();

        let first = backend.queue_dequeue().await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);

        backend
            .queue_release(first.id, Duration::ZERO, "boom")
            .await
            .unwrap();
        let second = backend.queue_dequeue().await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);

        backend.queue_bury(second.id, "gave up").await.unwrap();
        assert!(backend.queue_dequeue().await.unwrap().is_none());
        assert_eq!(backend.queue_pending_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_leases_reopen() {
        let backend = MemoryBackend::new();
        backend
            .commit(AtomicWrite::new().enqueue(TaskMessage::Renew {
                external_subscription_id: Uuid::new_v4(),
            }))
            .await
            .unwrap();
        let leased = backend.queue_dequeue().await.unwrap().unwrap();

        // Nothing stale yet under a generous visibility timeout
        assert_eq!(
            backend
                .queue_release_stale(Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
        // Zero visibility declares every lease stale
        assert_eq!(
            backend.queue_release_stale(Duration::ZERO).await.unwrap(),
            1
        );
        let again = backend.queue_dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, leased.id);
    }
}
