//! Lease renewal for outbound subscriptions.
//!
//! Fallback subscriptions renew by advancing their expiry in place; real
//! upstream subscriptions re-issue the subscribe POST with the same secret
//! and callback, and the upstream's verification callback refreshes the
//! lease.

use chrono::{Duration as ChronoDuration, Utc};
use feeder_core::config::AppConfig;
use feeder_core::message::TaskMessage;
use feeder_core::model::ExternalSubscription;
use feeder_core::{Error, Result};
use feeder_store::{Store, TaskQueue};
use uuid::Uuid;

/// Queue handler for `Renew` messages.
#[derive(Clone)]
pub struct RenewRunner {
    store: Store,
    http: reqwest::Client,
    config: AppConfig,
}

impl RenewRunner {
    pub fn new(store: Store, http: reqwest::Client, config: AppConfig) -> Self {
        Self {
            store,
            http,
            config,
        }
    }

    pub async fn handle(&self, external_subscription_id: Uuid) -> Result<()> {
        let Some((sub, version)) = self
            .store
            .get_external_subscription(external_subscription_id)
            .await?
        else {
            tracing::debug!(
                subscription_id = %external_subscription_id,
                "Renewal for missing subscription, dropping"
            );
            return Ok(());
        };
        if !sub.verified {
            tracing::debug!(
                subscription_id = %sub.id,
                "Renewal for unverified subscription, dropping"
            );
            return Ok(());
        }

        if sub.using_fallback {
            self.renew_fallback(sub, version).await
        } else {
            self.renew_upstream(sub, version).await
        }
    }

    async fn renew_fallback(&self, mut sub: ExternalSubscription, version: i64) -> Result<()> {
        let now = Utc::now();
        sub.expires = now + ChronoDuration::seconds(i64::from(sub.lease_seconds));
        sub.last_renewed = Some(now);
        self.store
            .update_external_subscription(&sub, version, Vec::new())
            .await?;
        tracing::debug!(
            subscription_id = %sub.id,
            topic = %sub.topic,
            "Fallback lease advanced"
        );
        Ok(())
    }

    async fn renew_upstream(&self, mut sub: ExternalSubscription, version: i64) -> Result<()> {
        let Some(hub_url) = sub.hub.clone() else {
            tracing::warn!(
                subscription_id = %sub.id,
                "Upstream subscription without a hub URL, cannot renew"
            );
            return Ok(());
        };

        let callback = format!(
            "{}{}",
            self.config.server.base_url.trim_end_matches('/'),
            sub.callback_path
        );
        let form = [
            ("hub.mode", "subscribe".to_string()),
            ("hub.topic", sub.topic.clone()),
            ("hub.callback", callback),
            ("hub.lease_seconds", sub.lease_seconds.to_string()),
            ("hub.secret", sub.secret.clone()),
        ];

        let outcome = self
            .http
            .post(&hub_url)
            .form(&form)
            .timeout(self.config.hub.webhook_timeout())
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                sub.last_renewed = Some(Utc::now());
                self.store
                    .update_external_subscription(&sub, version, Vec::new())
                    .await?;
                tracing::info!(
                    subscription_id = %sub.id,
                    topic = %sub.topic,
                    hub = %hub_url,
                    "Renewal accepted by upstream hub"
                );
                Ok(())
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let err = Error::upstream(&hub_url, status, "renewal rejected");
                sub.record_error(err.to_string());
                self.store
                    .update_external_subscription(&sub, version, Vec::new())
                    .await?;
                Err(err)
            }
            Err(send_err) => {
                let err = if send_err.is_timeout() {
                    Error::timeout(&hub_url)
                } else {
                    Error::upstream_io(&hub_url, send_err.to_string())
                };
                sub.record_error(err.to_string());
                self.store
                    .update_external_subscription(&sub, version, Vec::new())
                    .await?;
                Err(err)
            }
        }
    }
}

/// Enumerate renewal candidates and queue one `Renew` each.
pub async fn renew_due_subscriptions(
    store: &Store,
    queue: &TaskQueue,
    renewal_window_minutes: u32,
) -> Result<usize> {
    let now = Utc::now();
    let window = ChronoDuration::minutes(i64::from(renewal_window_minutes));
    let mut queued = 0;

    for (sub, _) in store.list_external_subscriptions().await? {
        if sub.needs_renewal(now, window) {
            queue
                .push(TaskMessage::Renew {
                    external_subscription_id: sub.id,
                })
                .await?;
            queued += 1;
        }
    }

    if queued > 0 {
        tracing::info!(count = queued, "Queued subscription renewals");
    }
    Ok(queued)
}
