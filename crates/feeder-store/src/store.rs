//! Typed entity operations over the key/value backend.
//!
//! Every mutation keeps its secondary indexes in the same atomic commit as
//! the row, and may ride queue messages along. Reads return the row together
//! with its CAS version; updates must present that version back.

use feeder_core::model::{ExternalSubscription, Feed, FeedItem, Subscription, UserCallback};
use feeder_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::{AtomicWrite, Enqueue, KvBackend, VersionedValue};
use crate::key::{keys, KvKey};

/// Attempts for a failing atomic commit before the error surfaces.
const COMMIT_ATTEMPTS: u32 = 5;
const COMMIT_BACKOFF_BASE_MS: u64 = 50;

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn KvBackend> {
        self.backend.clone()
    }

    /// Commit a write batch, retrying transient storage failures with
    /// exponential backoff. Conflicts and duplicates surface immediately;
    /// the caller holds stale state and must re-read.
    pub async fn commit(&self, write: AtomicWrite) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.backend.commit(write.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt + 1 < COMMIT_ATTEMPTS => {
                    attempt += 1;
                    let delay =
                        Duration::from_millis(COMMIT_BACKOFF_BASE_MS << attempt.min(6));
                    tracing::warn!(
                        attempt = attempt,
                        error = %err,
                        "Atomic commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_entity<T: DeserializeOwned>(&self, key: &KvKey) -> Result<Option<(T, i64)>> {
        match self.backend.get(key).await? {
            Some(VersionedValue { value, version }) => {
                let entity = serde_json::from_value(value)?;
                Ok(Some((entity, version)))
            }
            None => Ok(None),
        }
    }

    /// Resolve a secondary index entry to its target row.
    async fn get_via_index<T: DeserializeOwned>(
        &self,
        index_key: &KvKey,
        row_key: impl Fn(Uuid) -> KvKey,
    ) -> Result<Option<(T, i64)>> {
        let Some(index) = self.backend.get(index_key).await? else {
            return Ok(None);
        };
        let id = index_value_to_id(&index.value, index_key)?;
        self.get_entity(&row_key(id)).await
    }

    async fn list_entities<T: DeserializeOwned>(&self, prefix: &KvKey) -> Result<Vec<(T, i64)>> {
        let rows = self.backend.list_prefix(prefix).await?;
        let mut entities = Vec::with_capacity(rows.len());
        for (_, row) in rows {
            entities.push((serde_json::from_value(row.value)?, row.version));
        }
        Ok(entities)
    }

    /// Resolve every index entry under `prefix` to its row, skipping entries
    /// whose target row disappeared between the scan and the read.
    async fn list_via_index<T: DeserializeOwned>(
        &self,
        prefix: &KvKey,
        row_key: impl Fn(Uuid) -> KvKey,
    ) -> Result<Vec<(T, i64)>> {
        let index_rows = self.backend.list_prefix(prefix).await?;
        let mut entities = Vec::with_capacity(index_rows.len());
        for (raw_key, index) in index_rows {
            let id = match index.value.as_str().and_then(|s| Uuid::parse_str(s).ok()) {
                Some(id) => id,
                None => {
                    tracing::warn!(key = %raw_key, "Skipping malformed index entry");
                    continue;
                }
            };
            if let Some(entry) = self.get_entity(&row_key(id)).await? {
                entities.push(entry);
            }
        }
        Ok(entities)
    }
}

fn to_value<T: Serialize>(entity: &T) -> Result<Value> {
    Ok(serde_json::to_value(entity)?)
}

fn id_value(id: Uuid) -> Value {
    Value::String(id.to_string())
}

fn index_value_to_id(value: &Value, key: &KvKey) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| Error::storage(format!("Malformed index entry at {key}")))
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

impl Store {
    /// Insert a new subscription and its `(topic, callback)` index entry,
    /// riding any queue messages in the same commit.
    pub async fn insert_subscription(
        &self,
        sub: &Subscription,
        enqueues: Vec<Enqueue>,
    ) -> Result<()> {
        let mut write = AtomicWrite::new()
            .create(keys::subscription(sub.id), to_value(sub)?)
            .create(
                keys::subscription_by_topic_callback(&sub.topic, &sub.callback),
                id_value(sub.id),
            );
        write.enqueues = enqueues;
        self.commit(write).await
    }

    pub async fn update_subscription(
        &self,
        sub: &Subscription,
        expected_version: i64,
        enqueues: Vec<Enqueue>,
    ) -> Result<()> {
        let mut write = AtomicWrite::new().update(
            keys::subscription(sub.id),
            to_value(sub)?,
            expected_version,
        );
        write.enqueues = enqueues;
        self.commit(write).await
    }

    pub async fn get_subscription(&self, id: Uuid) -> Result<Option<(Subscription, i64)>> {
        self.get_entity(&keys::subscription(id)).await
    }

    pub async fn find_subscription(
        &self,
        topic: &str,
        callback: &str,
    ) -> Result<Option<(Subscription, i64)>> {
        self.get_via_index(
            &keys::subscription_by_topic_callback(topic, callback),
            keys::subscription,
        )
        .await
    }

    /// Every subscription registered for a topic, verified or not.
    pub async fn subscriptions_for_topic(&self, topic: &str) -> Result<Vec<(Subscription, i64)>> {
        self.list_via_index(&keys::subscriptions_for_topic(topic), keys::subscription)
            .await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<(Subscription, i64)>> {
        self.list_entities(&keys::all_subscriptions()).await
    }

    /// Delete the row and its index entry atomically.
    pub async fn delete_subscription(&self, sub: &Subscription) -> Result<()> {
        self.commit(
            AtomicWrite::new()
                .delete(keys::subscription(sub.id))
                .delete(keys::subscription_by_topic_callback(
                    &sub.topic,
                    &sub.callback,
                )),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

impl Store {
    pub async fn insert_feed(&self, feed: &Feed, enqueues: Vec<Enqueue>) -> Result<()> {
        let mut write = AtomicWrite::new()
            .create(keys::feed(feed.id), to_value(feed)?)
            .create(keys::feed_by_url(&feed.url), id_value(feed.id));
        write.enqueues = enqueues;
        self.commit(write).await
    }

    pub async fn update_feed(
        &self,
        feed: &Feed,
        expected_version: i64,
        enqueues: Vec<Enqueue>,
    ) -> Result<()> {
        let mut write =
            AtomicWrite::new().update(keys::feed(feed.id), to_value(feed)?, expected_version);
        write.enqueues = enqueues;
        self.commit(write).await
    }

    pub async fn get_feed(&self, id: Uuid) -> Result<Option<(Feed, i64)>> {
        self.get_entity(&keys::feed(id)).await
    }

    pub async fn find_feed_by_url(&self, url: &str) -> Result<Option<(Feed, i64)>> {
        self.get_via_index(&keys::feed_by_url(url), keys::feed).await
    }

    pub async fn list_feeds(&self) -> Result<Vec<(Feed, i64)>> {
        self.list_entities(&keys::all_feeds()).await
    }
}

// ---------------------------------------------------------------------------
// Feed items
// ---------------------------------------------------------------------------

impl Store {
    pub async fn get_feed_item_by_guid(
        &self,
        feed_id: Uuid,
        guid: &str,
    ) -> Result<Option<(FeedItem, i64)>> {
        self.get_via_index(&keys::feed_item_by_guid(feed_id, guid), keys::feed_item)
            .await
    }

    /// First sighting of an entry: row plus `(feed_id, guid)` index.
    pub async fn insert_feed_item(&self, item: &FeedItem) -> Result<()> {
        self.commit(
            AtomicWrite::new()
                .create(keys::feed_item(item.id), to_value(item)?)
                .create(
                    keys::feed_item_by_guid(item.feed_id, &item.guid),
                    id_value(item.id),
                ),
        )
        .await
    }

    /// Re-observation with newer content overwrites the existing row.
    pub async fn update_feed_item(&self, item: &FeedItem, expected_version: i64) -> Result<()> {
        self.commit(AtomicWrite::new().update(
            keys::feed_item(item.id),
            to_value(item)?,
            expected_version,
        ))
        .await
    }

    pub async fn list_feed_items(&self, feed_id: Uuid) -> Result<Vec<(FeedItem, i64)>> {
        self.list_via_index(&keys::feed_items_for_feed(feed_id), keys::feed_item)
            .await
    }
}

// ---------------------------------------------------------------------------
// External subscriptions
// ---------------------------------------------------------------------------

impl Store {
    pub async fn insert_external_subscription(
        &self,
        sub: &ExternalSubscription,
        enqueues: Vec<Enqueue>,
    ) -> Result<()> {
        let mut write = AtomicWrite::new()
            .create(keys::external_subscription(sub.id), to_value(sub)?)
            .create(
                keys::external_subscription_by_topic(&sub.topic),
                id_value(sub.id),
            )
            .create(
                keys::external_subscription_by_callback(&sub.callback_path),
                id_value(sub.id),
            );
        write.enqueues = enqueues;
        self.commit(write).await
    }

    pub async fn update_external_subscription(
        &self,
        sub: &ExternalSubscription,
        expected_version: i64,
        enqueues: Vec<Enqueue>,
    ) -> Result<()> {
        let mut write = AtomicWrite::new().update(
            keys::external_subscription(sub.id),
            to_value(sub)?,
            expected_version,
        );
        write.enqueues = enqueues;
        self.commit(write).await
    }

    pub async fn get_external_subscription(
        &self,
        id: Uuid,
    ) -> Result<Option<(ExternalSubscription, i64)>> {
        self.get_entity(&keys::external_subscription(id)).await
    }

    pub async fn find_external_subscription_by_topic(
        &self,
        topic: &str,
    ) -> Result<Option<(ExternalSubscription, i64)>> {
        self.get_via_index(
            &keys::external_subscription_by_topic(topic),
            keys::external_subscription,
        )
        .await
    }

    pub async fn find_external_subscription_by_callback(
        &self,
        callback_path: &str,
    ) -> Result<Option<(ExternalSubscription, i64)>> {
        self.get_via_index(
            &keys::external_subscription_by_callback(callback_path),
            keys::external_subscription,
        )
        .await
    }

    pub async fn list_external_subscriptions(&self) -> Result<Vec<(ExternalSubscription, i64)>> {
        self.list_entities(&keys::all_external_subscriptions()).await
    }

    pub async fn delete_external_subscription(&self, sub: &ExternalSubscription) -> Result<()> {
        self.commit(
            AtomicWrite::new()
                .delete(keys::external_subscription(sub.id))
                .delete(keys::external_subscription_by_topic(&sub.topic))
                .delete(keys::external_subscription_by_callback(&sub.callback_path)),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// User callbacks
// ---------------------------------------------------------------------------

impl Store {
    pub async fn insert_user_callback(&self, cb: &UserCallback) -> Result<()> {
        self.commit(
            AtomicWrite::new()
                .create(keys::user_callback(cb.id), to_value(cb)?)
                .create(
                    keys::user_callback_by_topic_url(&cb.topic, &cb.callback_url),
                    id_value(cb.id),
                ),
        )
        .await
    }

    pub async fn update_user_callback(
        &self,
        cb: &UserCallback,
        expected_version: i64,
    ) -> Result<()> {
        self.commit(AtomicWrite::new().update(
            keys::user_callback(cb.id),
            to_value(cb)?,
            expected_version,
        ))
        .await
    }

    pub async fn get_user_callback(&self, id: Uuid) -> Result<Option<(UserCallback, i64)>> {
        self.get_entity(&keys::user_callback(id)).await
    }

    pub async fn find_user_callback(
        &self,
        topic: &str,
        callback_url: &str,
    ) -> Result<Option<(UserCallback, i64)>> {
        self.get_via_index(
            &keys::user_callback_by_topic_url(topic, callback_url),
            keys::user_callback,
        )
        .await
    }

    pub async fn user_callbacks_for_topic(&self, topic: &str) -> Result<Vec<(UserCallback, i64)>> {
        self.list_via_index(&keys::user_callbacks_for_topic(topic), keys::user_callback)
            .await
    }

    pub async fn list_user_callbacks(&self) -> Result<Vec<(UserCallback, i64)>> {
        self.list_entities(&keys::all_user_callbacks()).await
    }

    pub async fn delete_user_callback(&self, cb: &UserCallback) -> Result<()> {
        self.commit(
            AtomicWrite::new()
                .delete(keys::user_callback(cb.id))
                .delete(keys::user_callback_by_topic_url(&cb.topic, &cb.callback_url)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chrono::Duration as ChronoDuration;
    use feeder_core::message::{TaskMessage, VerificationMode};

    fn store() -> Store {
        Store::new(Arc::new(MemoryBackend::new()))
    }

    fn subscription(topic: &str, callback: &str) -> Subscription {
        Subscription::new(
            topic.into(),
            callback.into(),
            3600,
            None,
            ChronoDuration::minutes(15),
        )
    }

    #[tokio::test]
    async fn subscription_round_trip() {
        let store = store();
        let sub = subscription("https://ex.com/a", "https://sub.ex/cb");
        store.insert_subscription(&sub, Vec::new()).await.unwrap();

        let (loaded, version) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(loaded, sub);
        assert_eq!(version, 1);

        let (by_index, _) = store
            .find_subscription("https://ex.com/a", "https://sub.ex/cb")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_index.id, sub.id);
    }

    #[tokio::test]
    async fn duplicate_topic_callback_pair_rejected() {
        let store = store();
        let sub = subscription("https://ex.com/a", "https://sub.ex/cb");
        store.insert_subscription(&sub, Vec::new()).await.unwrap();

        let again = subscription("https://ex.com/a", "https://sub.ex/cb");
        let err = store
            .insert_subscription(&again, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate { .. }));
    }

    #[tokio::test]
    async fn delete_erases_index() {
        let store = store();
        let sub = subscription("https://ex.com/a", "https://sub.ex/cb");
        store.insert_subscription(&sub, Vec::new()).await.unwrap();
        store.delete_subscription(&sub).await.unwrap();

        assert!(store.get_subscription(sub.id).await.unwrap().is_none());
        assert!(store
            .find_subscription("https://ex.com/a", "https://sub.ex/cb")
            .await
            .unwrap()
            .is_none());

        // The pair is insertable again
        let replacement = subscription("https://ex.com/a", "https://sub.ex/cb");
        store
            .insert_subscription(&replacement, Vec::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn topic_scan_sees_all_callbacks() {
        let store = store();
        for n in 0..3 {
            let sub = subscription("https://ex.com/a", &format!("https://sub{n}.ex/cb"));
            store.insert_subscription(&sub, Vec::new()).await.unwrap();
        }
        let other = subscription("https://ex.com/b", "https://sub0.ex/cb");
        store.insert_subscription(&other, Vec::new()).await.unwrap();

        let for_topic = store
            .subscriptions_for_topic("https://ex.com/a")
            .await
            .unwrap();
        assert_eq!(for_topic.len(), 3);
    }

    #[tokio::test]
    async fn subscription_insert_rides_verify_message() {
        let store = store();
        let sub = subscription("https://ex.com/a", "https://sub.ex/cb");
        let verify = TaskMessage::Verify {
            subscription_id: sub.id,
            mode: VerificationMode::Subscribe,
            token: sub.verification_token.clone().unwrap(),
            challenge: "challenge".into(),
            topic: sub.topic.clone(),
            lease_seconds: Some(3600),
        };
        store
            .insert_subscription(&sub, vec![Enqueue::immediate(verify)])
            .await
            .unwrap();

        let backend = store.backend();
        assert_eq!(backend.queue_pending_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn feed_item_guid_is_unique_per_feed() {
        let store = store();
        let feed_id = Uuid::new_v4();
        let item = FeedItem {
            id: Uuid::new_v4(),
            feed_id,
            guid: "guid-1".into(),
            url: Some("https://ex.com/1".into()),
            title: Some("One".into()),
            author: None,
            published: None,
            updated: None,
            categories: Vec::new(),
        };
        store.insert_feed_item(&item).await.unwrap();

        let dup = FeedItem {
            id: Uuid::new_v4(),
            ..item.clone()
        };
        assert!(matches!(
            store.insert_feed_item(&dup).await.unwrap_err(),
            Error::Duplicate { .. }
        ));

        // Same guid under a different feed is a different entry
        let elsewhere = FeedItem {
            id: Uuid::new_v4(),
            feed_id: Uuid::new_v4(),
            ..item.clone()
        };
        store.insert_feed_item(&elsewhere).await.unwrap();

        let (found, _) = store
            .get_feed_item_by_guid(feed_id, "guid-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, item.id);
    }

    #[tokio::test]
    async fn stale_feed_update_conflicts() {
        let store = store();
        let feed = Feed::new("https://ex.com/feed.xml".into(), 60);
        store.insert_feed(&feed, Vec::new()).await.unwrap();

        let (mut first, v1) = store.get_feed(feed.id).await.unwrap().unwrap();
        let (mut second, v2) = store.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(v1, v2);

        first.title = Some("First".into());
        store.update_feed(&first, v1, Vec::new()).await.unwrap();

        second.title = Some("Second".into());
        let err = store.update_feed(&second, v2, Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let (current, _) = store.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(current.title.as_deref(), Some("First"));
    }

    #[tokio::test]
    async fn external_subscription_indexes() {
        let store = store();
        let sub = ExternalSubscription::to_hub(
            "https://ex.com/feed.xml".into(),
            "https://hub.ex/".into(),
            86_400,
        );
        store
            .insert_external_subscription(&sub, Vec::new())
            .await
            .unwrap();

        assert!(store
            .find_external_subscription_by_topic("https://ex.com/feed.xml")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_external_subscription_by_callback(&sub.callback_path)
            .await
            .unwrap()
            .is_some());

        store.delete_external_subscription(&sub).await.unwrap();
        assert!(store
            .find_external_subscription_by_callback(&sub.callback_path)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn user_callbacks_scan_by_topic() {
        let store = store();
        for n in 0..2 {
            let cb = UserCallback::new(
                "https://ex.com/a".into(),
                format!("https://user{n}.ex/hook"),
            );
            store.insert_user_callback(&cb).await.unwrap();
        }
        let callbacks = store
            .user_callbacks_for_topic("https://ex.com/a")
            .await
            .unwrap();
        assert_eq!(callbacks.len(), 2);
        assert!(store
            .user_callbacks_for_topic("https://ex.com/other")
            .await
            .unwrap()
            .is_empty());
    }
}
