//! The per-feed poll pipeline and due-set enumeration.

use chrono::{Duration as ChronoDuration, Utc};
use feeder_core::config::PollingConfig;
use feeder_core::message::TaskMessage;
use feeder_core::model::{Feed, FeedItem};
use feeder_core::{Error, Result};
use feeder_feed::fetch::{ConditionalHeaders, FetchClient};
use feeder_feed::parser::{self, ParsedEntry};
use feeder_hub::HubEngine;
use feeder_store::{Store, TaskQueue};
use rand::Rng;
use uuid::Uuid;

/// What a single poll concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The feed was not eligible (inactive, WebSub-capable, or gone).
    Skipped,
    /// Upstream answered 304; nothing to do.
    NotModified,
    /// Content fetched but every entry was already known.
    NoChange,
    /// New entries were stored and a notification was synthesized.
    NewItems(usize),
}

/// Queue handler for `PollFeed` messages.
#[derive(Clone)]
pub struct PollRunner {
    store: Store,
    fetch: FetchClient,
    hub: HubEngine,
}

impl PollRunner {
    pub fn new(store: Store, fetch: FetchClient, hub: HubEngine) -> Self {
        Self { store, fetch, hub }
    }

    /// Poll one feed by id.
    pub async fn handle(&self, feed_id: Uuid) -> Result<PollOutcome> {
        let Some((feed, version)) = self.store.get_feed(feed_id).await? else {
            tracing::debug!(feed_id = %feed_id, "Poll for missing feed, dropping");
            return Ok(PollOutcome::Skipped);
        };
        if !feed.active || feed.supports_websub {
            tracing::debug!(
                feed_id = %feed_id,
                active = feed.active,
                websub = feed.supports_websub,
                "Feed left the polling set, dropping"
            );
            return Ok(PollOutcome::Skipped);
        }
        self.poll(feed, version).await
    }

    async fn poll(&self, mut feed: Feed, version: i64) -> Result<PollOutcome> {
        let conditional = ConditionalHeaders {
            etag: feed.etag.clone(),
            last_modified: feed.last_modified.clone(),
        };

        let response = match self.fetch.get(&feed.url, Some(&conditional)).await {
            Ok(response) => response,
            Err(err) => {
                self.commit_failure(feed, version, &err.to_string()).await?;
                return Err(err);
            }
        };

        if response.is_not_modified() {
            feed.last_fetched = Some(Utc::now());
            self.store.update_feed(&feed, version, Vec::new()).await?;
            tracing::debug!(feed_id = %feed.id, url = %feed.url, "Feed not modified");
            return Ok(PollOutcome::NotModified);
        }

        if !response.is_success() {
            let err = Error::upstream(&feed.url, response.status, "feed fetch failed");
            self.commit_failure(feed, version, &err.to_string()).await?;
            return Err(err);
        }

        let parsed = match parser::parse_feed(&response.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.commit_failure(feed, version, &err.to_string()).await?;
                return Err(err);
            }
        };

        if let Some(title) = parsed.title.clone() {
            feed.title = Some(title);
        }
        if let Some(description) = parsed.description.clone() {
            feed.description = Some(description);
        }

        // A hub link takes this feed out of the polling set for good.
        if let Some(hub_url) = parsed.hub_url.clone() {
            tracing::info!(
                feed_id = %feed.id,
                url = %feed.url,
                hub = %hub_url,
                "Feed advertises a WebSub hub, disabling polling"
            );
            feed.supports_websub = true;
            feed.websub_hub = Some(hub_url);
        }

        let ingest = self.ingest_entries(&feed, &parsed.entries).await?;

        feed.last_fetched = Some(Utc::now());
        feed.etag = response.etag.clone();
        feed.last_modified = response.last_modified.clone();
        if let Some(latest) = ingest.latest_guid {
            feed.last_processed_entry_id = Some(latest);
        }
        if ingest.new_items > 0 {
            feed.last_updated = Some(Utc::now());
        }
        feed.clear_errors();
        self.store.update_feed(&feed, version, Vec::new()).await?;

        if ingest.new_items > 0 {
            let content_type = response
                .content_type
                .clone()
                .unwrap_or_else(|| "application/rss+xml".to_string());
            let notified = self
                .hub
                .process_content_notification(&feed.url, response.body, content_type)
                .await?;
            tracing::info!(
                feed_id = %feed.id,
                url = %feed.url,
                new_items = ingest.new_items,
                subscribers = notified,
                "Poll found new content"
            );
            Ok(PollOutcome::NewItems(ingest.new_items))
        } else {
            Ok(PollOutcome::NoChange)
        }
    }

    /// Walk entries in feed order, stopping at the last processed guid.
    async fn ingest_entries(&self, feed: &Feed, entries: &[ParsedEntry]) -> Result<IngestResult> {
        let mut new_items = 0;
        let mut latest: Option<(String, Option<chrono::DateTime<Utc>>)> = None;

        for entry in entries {
            let Some(guid) = entry.guid.as_deref() else {
                tracing::debug!(feed_id = %feed.id, "Entry without guid or link, skipping");
                continue;
            };

            // Everything past the stored marker was seen in a previous cycle
            if feed.last_processed_entry_id.as_deref() == Some(guid) {
                break;
            }

            match latest {
                Some((_, best)) if entry.timestamp() <= best => {}
                _ => latest = Some((guid.to_string(), entry.timestamp())),
            }

            match self.store.get_feed_item_by_guid(feed.id, guid).await? {
                Some((existing, item_version)) => {
                    let newer = match (entry.updated, existing.updated) {
                        (Some(incoming), Some(stored)) => incoming > stored,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    if newer {
                        let updated = FeedItem {
                            id: existing.id,
                            feed_id: feed.id,
                            guid: guid.to_string(),
                            url: entry.url.clone().or(existing.url),
                            title: entry.title.clone().or(existing.title),
                            author: entry.author.clone().or(existing.author),
                            published: entry.published.or(existing.published),
                            updated: entry.updated,
                            categories: entry.categories.clone(),
                        };
                        self.store.update_feed_item(&updated, item_version).await?;
                    }
                }
                None => {
                    let item = FeedItem {
                        id: Uuid::new_v4(),
                        feed_id: feed.id,
                        guid: guid.to_string(),
                        url: entry.url.clone(),
                        title: entry.title.clone(),
                        author: entry.author.clone(),
                        published: entry.published,
                        updated: entry.updated,
                        categories: entry.categories.clone(),
                    };
                    match self.store.insert_feed_item(&item).await {
                        Ok(()) => new_items += 1,
                        // A concurrent ingest won the race; treat as known
                        Err(Error::Duplicate { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        Ok(IngestResult {
            new_items,
            latest_guid: latest.map(|(guid, _)| guid),
        })
    }

    async fn commit_failure(&self, mut feed: Feed, version: i64, message: &str) -> Result<()> {
        feed.record_error(message);
        feed.last_fetched = Some(Utc::now());
        self.store.update_feed(&feed, version, Vec::new()).await?;
        tracing::warn!(
            feed_id = %feed.id,
            url = %feed.url,
            error_count = feed.error_count,
            error = %message,
            "Feed poll failed"
        );
        Ok(())
    }
}

struct IngestResult {
    new_items: usize,
    latest_guid: Option<String>,
}

/// Enumerate due feeds and queue one poll each.
///
/// Each feed's deadline is jittered by a small uniform offset so herds of
/// feeds sharing a cadence spread out. The queue deduplicates pending polls
/// per feed.
pub async fn enqueue_due_polls(
    store: &Store,
    queue: &TaskQueue,
    config: &PollingConfig,
) -> Result<usize> {
    let now = Utc::now();
    let mut queued = 0;

    for (feed, _) in store.list_feeds().await? {
        let jitter_minutes = if config.jitter_minutes == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=i64::from(config.jitter_minutes))
        };
        if feed.is_due(now, ChronoDuration::minutes(jitter_minutes)) {
            queue.push(TaskMessage::PollFeed { feed_id: feed.id }).await?;
            queued += 1;
        }
    }

    if queued > 0 {
        tracing::debug!(count = queued, "Queued due feed polls");
    }
    Ok(queued)
}
