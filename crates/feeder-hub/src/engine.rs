//! Hub operations: subscription requests, publish, content fan-out.

use chrono::Duration as ChronoDuration;
use feeder_core::config::HubConfig;
use feeder_core::message::{TaskMessage, VerificationMode};
use feeder_core::model::{random_token, Subscription};
use feeder_core::{Error, Result};
use feeder_feed::fetch::FetchClient;
use feeder_store::backend::Enqueue;
use feeder_store::Store;
use url::Url;
use uuid::Uuid;

/// Secrets above this size are rejected outright.
const MAX_SECRET_BYTES: usize = 200;

/// A parsed `hub.mode=subscribe|unsubscribe` request.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub mode: VerificationMode,
    pub topic: String,
    pub callback: String,
    pub lease_seconds: Option<u32>,
    pub secret: Option<String>,
}

/// Result of an accepted subscription request.
#[derive(Debug, Clone)]
pub struct SubscriptionOutcome {
    /// Absent when an unsubscribe referenced an unknown pair.
    pub subscription_id: Option<Uuid>,
}

/// The hub protocol engine.
///
/// Owns no state of its own: everything flows through the store and queue so
/// concurrent instances behave identically.
#[derive(Clone)]
pub struct HubEngine {
    store: Store,
    fetch: FetchClient,
    config: HubConfig,
}

impl HubEngine {
    pub fn new(store: Store, fetch: FetchClient, config: HubConfig) -> Self {
        Self {
            store,
            fetch,
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Handle `hub.mode=subscribe|unsubscribe`.
    ///
    /// The subscription row is written (or refreshed) in the pending state
    /// and the `Verify` message rides the same atomic commit, so a 202 to
    /// the caller implies the verification is durably queued.
    pub async fn process_subscription_request(
        &self,
        request: SubscriptionRequest,
    ) -> Result<SubscriptionOutcome> {
        require_http_url("hub.topic", &request.topic)?;
        require_http_url("hub.callback", &request.callback)?;

        if let Some(lease) = request.lease_seconds {
            if lease == 0 || lease > self.config.max_lease_seconds {
                return Err(Error::invalid_input(
                    "hub.lease_seconds",
                    format!("must be in 1..={}", self.config.max_lease_seconds),
                ));
            }
        }
        if let Some(secret) = &request.secret {
            if secret.len() > MAX_SECRET_BYTES {
                return Err(Error::invalid_input(
                    "hub.secret",
                    format!("must be at most {MAX_SECRET_BYTES} bytes"),
                ));
            }
        }

        let lease_seconds = request
            .lease_seconds
            .unwrap_or(self.config.default_lease_seconds);
        let existing = self
            .store
            .find_subscription(&request.topic, &request.callback)
            .await?;

        match request.mode {
            VerificationMode::Subscribe => {
                self.accept_subscribe(request, lease_seconds, existing).await
            }
            VerificationMode::Unsubscribe => self.accept_unsubscribe(request, existing).await,
        }
    }

    async fn accept_subscribe(
        &self,
        request: SubscriptionRequest,
        lease_seconds: u32,
        existing: Option<(Subscription, i64)>,
    ) -> Result<SubscriptionOutcome> {
        let verification_window =
            ChronoDuration::minutes(i64::from(self.config.verification_window_minutes));
        let token = random_token();

        let (sub, version) = match existing {
            Some((mut sub, version)) => {
                // Re-subscription restarts verification from scratch
                sub.verified = false;
                sub.lease_seconds = lease_seconds;
                sub.secret = request.secret;
                sub.verification_token = Some(token.clone());
                sub.verification_expires = Some(chrono::Utc::now() + verification_window);
                (sub, Some(version))
            }
            None => {
                let mut sub = Subscription::new(
                    request.topic.clone(),
                    request.callback.clone(),
                    lease_seconds,
                    request.secret,
                    verification_window,
                );
                sub.verification_token = Some(token.clone());
                (sub, None)
            }
        };

        let verify = Enqueue::immediate(TaskMessage::Verify {
            subscription_id: sub.id,
            mode: VerificationMode::Subscribe,
            token,
            challenge: random_token(),
            topic: sub.topic.clone(),
            lease_seconds: Some(lease_seconds),
        });

        match version {
            Some(version) => {
                self.store
                    .update_subscription(&sub, version, vec![verify])
                    .await?
            }
            None => self.store.insert_subscription(&sub, vec![verify]).await?,
        }

        tracing::info!(
            subscription_id = %sub.id,
            topic = %sub.topic,
            callback = %sub.callback,
            lease_seconds = lease_seconds,
            "Subscription accepted, verification queued"
        );
        Ok(SubscriptionOutcome {
            subscription_id: Some(sub.id),
        })
    }

    async fn accept_unsubscribe(
        &self,
        request: SubscriptionRequest,
        existing: Option<(Subscription, i64)>,
    ) -> Result<SubscriptionOutcome> {
        let Some((mut sub, version)) = existing else {
            tracing::debug!(
                topic = %request.topic,
                callback = %request.callback,
                "Unsubscribe for unknown pair, nothing to do"
            );
            return Ok(SubscriptionOutcome {
                subscription_id: None,
            });
        };

        let token = random_token();
        sub.verification_token = Some(token.clone());
        sub.verification_expires = Some(
            chrono::Utc::now()
                + ChronoDuration::minutes(i64::from(self.config.verification_window_minutes)),
        );

        let verify = Enqueue::immediate(TaskMessage::Verify {
            subscription_id: sub.id,
            mode: VerificationMode::Unsubscribe,
            token,
            challenge: random_token(),
            topic: sub.topic.clone(),
            lease_seconds: None,
        });
        self.store
            .update_subscription(&sub, version, vec![verify])
            .await?;

        tracing::info!(
            subscription_id = %sub.id,
            topic = %sub.topic,
            "Unsubscribe accepted, verification queued"
        );
        Ok(SubscriptionOutcome {
            subscription_id: Some(sub.id),
        })
    }

    /// Handle `hub.mode=publish`: fetch the topic and fan out its content.
    pub async fn process_publish_request(&self, topic: &str) -> Result<usize> {
        require_http_url("hub.topic", topic)?;

        let response = self.fetch.get(topic, None).await?;
        if !response.is_success() {
            return Err(Error::upstream(topic, response.status, "publish fetch failed"));
        }

        let content_type = response
            .content_type
            .clone()
            .unwrap_or_else(|| "application/rss+xml".to_string());
        self.process_content_notification(topic, response.body, content_type)
            .await
    }

    /// Queue one `Distribute` per verified subscriber of the topic.
    ///
    /// The body is relayed verbatim. Returns the number of deliveries queued.
    pub async fn process_content_notification(
        &self,
        topic: &str,
        body: Vec<u8>,
        content_type: String,
    ) -> Result<usize> {
        let subscriptions = self.store.subscriptions_for_topic(topic).await?;
        let verified: Vec<_> = subscriptions
            .into_iter()
            .filter(|(sub, _)| sub.verified)
            .collect();

        if verified.is_empty() {
            tracing::debug!(topic = %topic, "Content notification with no verified subscribers");
            return Ok(0);
        }

        let mut write = feeder_store::AtomicWrite::new();
        for (sub, _) in &verified {
            write = write.enqueue_with(
                Enqueue::immediate(TaskMessage::Distribute {
                    subscription_id: sub.id,
                    topic: topic.to_string(),
                    content_type: content_type.clone(),
                    body: body.clone(),
                })
                .with_retries(self.config.webhook_retries),
            );
        }
        self.store.commit(write).await?;

        tracing::info!(
            topic = %topic,
            subscribers = verified.len(),
            bytes = body.len(),
            "Content queued for distribution"
        );
        Ok(verified.len())
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
