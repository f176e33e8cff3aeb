//! Outbound subscriptions and the upstream callback endpoint.

use chrono::{Duration as ChronoDuration, Utc};
use feeder_core::config::AppConfig;
use feeder_core::message::TaskMessage;
use feeder_core::model::{ExternalSubscription, Feed, UserCallback};
use feeder_core::{Error, Result};
use feeder_feed::discovery::Discovery;
use feeder_store::{Store, TaskQueue};
use url::Url;
use uuid::Uuid;

use crate::callbacks;

/// What `subscribe_to_feed` set up.
#[derive(Debug, Clone)]
pub struct SubscribeOutcome {
    pub subscription_id: Uuid,
    pub using_fallback: bool,
    /// The upstream hub has not confirmed us yet
    pub pending_verification: bool,
    /// The user callback still needs its token round-trip
    pub user_callback_pending: bool,
}

/// Result of a hit on `/callback/:id`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// Echo this string back as `text/plain`.
    ChallengeEcho(String),
    /// Content accepted; this many relays were queued.
    ContentAccepted(usize),
    /// Denial acknowledged (possibly converted to polling fallback).
    DenialHandled,
}

/// Subscribes to upstream hubs and fields their callbacks.
#[derive(Clone)]
pub struct ExternalClient {
    store: Store,
    queue: TaskQueue,
    discovery: Discovery,
    http: reqwest::Client,
    config: AppConfig,
}

impl ExternalClient {
    pub fn new(
        store: Store,
        queue: TaskQueue,
        discovery: Discovery,
        http: reqwest::Client,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            queue,
            discovery,
            http,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The externally visible URL of a subscription's callback path.
    fn callback_url(&self, callback_path: &str) -> String {
        format!(
            "{}{}",
            self.config.server.base_url.trim_end_matches('/'),
            callback_path
        )
    }

    /// The outward face: follow a topic for a user.
    ///
    /// Registers (or reuses) the user callback, then ensures one
    /// ExternalSubscription exists for the topic: against the topic's own
    /// hub when discovery finds one, else as a polling fallback.
    pub async fn subscribe_to_feed(
        &self,
        topic: &str,
        user_callback_url: Option<&str>,
    ) -> Result<SubscribeOutcome> {
        require_http_url("topic", topic)?;

        let mut user_callback_pending = false;
        if let Some(callback_url) = user_callback_url {
            require_http_url("callback", callback_url)?;
            user_callback_pending = !self.ensure_user_callback(topic, callback_url).await?;
        }

        if let Some((existing, _)) = self
            .store
            .find_external_subscription_by_topic(topic)
            .await?
        {
            tracing::debug!(
                topic = %topic,
                subscription_id = %existing.id,
                "Topic already subscribed, attaching user callback only"
            );
            return Ok(SubscribeOutcome {
                subscription_id: existing.id,
                using_fallback: existing.using_fallback,
                pending_verification: !existing.verified,
                user_callback_pending,
            });
        }

        let discovered = self.discovery.discover(topic).await?;
        let outcome = match discovered.hub_url {
            Some(hub_url) => self.subscribe_to_external_hub(topic, &hub_url).await?,
            None => {
                let feed_url = discovered
                    .feed_url
                    .ok_or_else(|| Error::validation(format!("no hub or feed found at {topic}")))?;
                self.subscribe_to_own_hub(topic, &feed_url).await?
            }
        };

        Ok(SubscribeOutcome {
            user_callback_pending,
            ..outcome
        })
    }

    /// Returns true when the callback ended up verified.
    async fn ensure_user_callback(&self, topic: &str, callback_url: &str) -> Result<bool> {
        match self.store.find_user_callback(topic, callback_url).await? {
            Some((cb, version)) => {
                if cb.verified {
                    return Ok(true);
                }
                // Unverified: mint a fresh token and try the round-trip again
                let mut cb = cb;
                cb.refresh_token();
                self.store.update_user_callback(&cb, version).await?;
                callbacks::send_verification(&self.store, &self.http, cb).await
            }
            None => {
                let cb = UserCallback::new(topic.to_string(), callback_url.to_string());
                self.store.insert_user_callback(&cb).await?;
                callbacks::send_verification(&self.store, &self.http, cb).await
            }
        }
    }

    /// Subscribe at a discovered upstream hub.
    pub async fn subscribe_to_external_hub(
        &self,
        topic: &str,
        hub_url: &str,
    ) -> Result<SubscribeOutcome> {
        let sub = ExternalSubscription::to_hub(
            topic.to_string(),
            hub_url.to_string(),
            self.config.hub.default_lease_seconds,
        );
        self.store
            .insert_external_subscription(&sub, Vec::new())
            .await?;

        match self.post_subscribe_form(&sub, hub_url).await {
            Ok(()) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    topic = %topic,
                    hub = %hub_url,
                    "Subscribed at upstream hub, awaiting verification"
                );
                Ok(SubscribeOutcome {
                    subscription_id: sub.id,
                    using_fallback: false,
                    pending_verification: true,
                    user_callback_pending: false,
                })
            }
            Err(err) => {
                self.record_external_error(sub.id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    /// No hub anywhere: poll the feed ourselves. Polling is the verification.
    pub async fn subscribe_to_own_hub(
        &self,
        topic: &str,
        feed_url: &str,
    ) -> Result<SubscribeOutcome> {
        let sub = ExternalSubscription::fallback(
            topic.to_string(),
            self.config.hub.default_lease_seconds,
        );

        let feed_id = self.ensure_feed(feed_url).await?;
        self.store
            .insert_external_subscription(&sub, Vec::new())
            .await?;
        self.queue.push(TaskMessage::PollFeed { feed_id }).await?;

        tracing::info!(
            subscription_id = %sub.id,
            topic = %topic,
            feed_url = %feed_url,
            "No upstream hub found, using polling fallback"
        );
        Ok(SubscribeOutcome {
            subscription_id: sub.id,
            using_fallback: true,
            pending_verification: false,
            user_callback_pending: false,
        })
    }

    /// Make sure a Feed row exists for the URL; returns its id.
    async fn ensure_feed(&self, feed_url: &str) -> Result<Uuid> {
        if let Some((feed, _)) = self.store.find_feed_by_url(feed_url).await? {
            return Ok(feed.id);
        }
        let interval = self
            .config
            .polling
            .clamp_interval(self.config.polling.default_interval_minutes);
        let feed = Feed::new(feed_url.to_string(), interval);
        let feed_id = feed.id;
        match self.store.insert_feed(&feed, Vec::new()).await {
            Ok(()) => Ok(feed_id),
            // Lost a creation race; the other row wins
            Err(Error::Duplicate { .. }) => {
                let (existing, _) = self
                    .store
                    .find_feed_by_url(feed_url)
                    .await?
                    .ok_or_else(|| Error::storage("feed vanished after duplicate insert"))?;
                Ok(existing.id)
            }
            Err(err) => Err(err),
        }
    }

    async fn post_subscribe_form(&self, sub: &ExternalSubscription, hub_url: &str) -> Result<()> {
        let form = [
            ("hub.mode", "subscribe".to_string()),
            ("hub.topic", sub.topic.clone()),
            ("hub.callback", self.callback_url(&sub.callback_path)),
            ("hub.lease_seconds", sub.lease_seconds.to_string()),
            ("hub.secret", sub.secret.clone()),
        ];

        let response = self
            .http
            .post(hub_url)
            .form(&form)
            .timeout(self.config.hub.webhook_timeout())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(hub_url)
                } else {
                    Error::upstream_io(hub_url, e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(Error::upstream(hub_url, status, "subscribe rejected"))
        }
    }

    /// Handle a hit on our `/callback/:id` endpoint.
    pub async fn handle_callback(
        &self,
        callback_path: &str,
        mode: Option<&str>,
        topic: Option<&str>,
        challenge: Option<&str>,
        lease_seconds: Option<u32>,
        body: Option<(Vec<u8>, String)>,
    ) -> Result<CallbackOutcome> {
        let Some((sub, version)) = self
            .store
            .find_external_subscription_by_callback(callback_path)
            .await?
        else {
            return Err(Error::not_found("ExternalSubscription", callback_path));
        };

        match mode {
            Some(mode @ ("subscribe" | "unsubscribe")) => {
                if let Some(topic) = topic {
                    if topic != sub.topic {
                        return Err(Error::validation(format!(
                            "verification topic {topic} does not match subscription"
                        )));
                    }
                }
                let challenge = challenge
                    .ok_or_else(|| Error::invalid_input("hub.challenge", "missing"))?;

                if mode == "unsubscribe" {
                    self.store.delete_external_subscription(&sub).await?;
                    tracing::info!(
                        subscription_id = %sub.id,
                        topic = %sub.topic,
                        "Upstream confirmed unsubscribe"
                    );
                } else {
                    let mut sub = sub;
                    sub.verified = true;
                    let lease = lease_seconds.unwrap_or(sub.lease_seconds);
                    sub.lease_seconds = lease;
                    sub.expires = Utc::now() + ChronoDuration::seconds(i64::from(lease));
                    self.store
                        .update_external_subscription(&sub, version, Vec::new())
                        .await?;
                    tracing::info!(
                        subscription_id = %sub.id,
                        topic = %sub.topic,
                        lease_seconds = lease,
                        "Upstream verified our subscription"
                    );
                }
                Ok(CallbackOutcome::ChallengeEcho(challenge.to_string()))
            }
            Some("denied") => {
                // The hub will not have us; fall back to polling the topic
                // directly when it is a feed we can fetch.
                self.fallback_after_denial(sub, version).await?;
                Ok(CallbackOutcome::DenialHandled)
            }
            Some(other) => Err(Error::invalid_input(
                "hub.mode",
                format!("unsupported mode {other:?}"),
            )),
            None => {
                let (body, content_type) =
                    body.ok_or_else(|| Error::invalid_input("body", "missing content"))?;
                if !sub.verified {
                    return Err(Error::validation(
                        "content received for unverified subscription",
                    ));
                }
                let queued = self.relay_content(&sub.topic, body, content_type).await?;
                Ok(CallbackOutcome::ContentAccepted(queued))
            }
        }
    }

    /// Queue one relay per verified user callback on the topic.
    async fn relay_content(
        &self,
        topic: &str,
        body: Vec<u8>,
        content_type: String,
    ) -> Result<usize> {
        let callbacks = self.store.user_callbacks_for_topic(topic).await?;
        let verified: Vec<_> = callbacks
            .into_iter()
            .filter(|(cb, _)| cb.verified)
            .collect();
        if verified.is_empty() {
            return Ok(0);
        }

        let mut write = feeder_store::AtomicWrite::new();
        for (cb, _) in &verified {
            write = write.enqueue_with(
                feeder_store::Enqueue::immediate(TaskMessage::RelayToUserCallback {
                    user_callback_id: cb.id,
                    topic: topic.to_string(),
                    content_type: content_type.clone(),
                    body: body.clone(),
                })
                .with_retries(self.config.hub.webhook_retries),
            );
        }
        self.store.commit(write).await?;

        tracing::info!(
            topic = %topic,
            callbacks = verified.len(),
            "Upstream content queued for relay"
        );
        Ok(verified.len())
    }

    /// Challenge rejected upstream: if the topic itself is a pollable feed,
    /// keep the subscription alive on the polling fallback. Inbound
    /// subscriptions never get this treatment.
    async fn fallback_after_denial(
        &self,
        mut sub: ExternalSubscription,
        version: i64,
    ) -> Result<()> {
        let discovered = self.discovery.discover(&sub.topic).await;
        let feed_url = match discovered {
            Ok(result) => result.feed_url,
            Err(err) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    topic = %sub.topic,
                    error = %err,
                    "Denied upstream and topic is not fetchable, leaving unverified"
                );
                self.record_external_error(sub.id, "denied by upstream hub")
                    .await?;
                return Ok(());
            }
        };

        let Some(feed_url) = feed_url else {
            self.record_external_error(sub.id, "denied by upstream hub")
                .await?;
            return Ok(());
        };

        let feed_id = self.ensure_feed(&feed_url).await?;
        sub.using_fallback = true;
        sub.verified = true;
        sub.hub = None;
        self.store
            .update_external_subscription(&sub, version, Vec::new())
            .await?;
        self.queue.push(TaskMessage::PollFeed { feed_id }).await?;

        tracing::info!(
            subscription_id = %sub.id,
            topic = %sub.topic,
            feed_url = %feed_url,
            "Upstream denied subscription, switched to polling fallback"
        );
        Ok(())
    }

    async fn record_external_error(&self, id: Uuid, message: &str) -> Result<()> {
        if let Some((mut sub, version)) = self.store.get_external_subscription(id).await? {
            sub.record_error(message);
            match self
                .store
                .update_external_subscription(&sub, version, Vec::new())
                .await
            {
                Ok(()) | Err(Error::Conflict { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn require_http_url(field: &str, value: &str) -> Result<()> {
    match Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
        _ => Err(Error::invalid_input(
            field,
            format!("must be an absolute http(s) URL, got {value:?}"),
        )),
    }
}
