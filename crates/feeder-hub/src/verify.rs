//! Subscriber verification.
//!
//! Executes the `Verify` queue message: the challenge GET against the
//! subscriber's callback and the resulting state transition. Pending →
//! Verified for a confirmed subscribe, Pending → Deleted for unsubscribe;
//! everything else leaves the row for the sweep.

use feeder_core::message::VerificationMode;
use feeder_core::{Error, Result};
use std::time::Duration;
use uuid::Uuid;

use feeder_store::Store;

/// Attempts to push a CAS update before giving up on a hot row.
const CAS_ATTEMPTS: u32 = 3;

/// Queue handler for `Verify` messages.
#[derive(Clone)]
pub struct VerifyRunner {
    store: Store,
    http: reqwest::Client,
    timeout: Duration,
}

impl VerifyRunner {
    pub fn new(store: Store, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            store,
            http,
            timeout,
        }
    }

    /// Run one verification round-trip.
    ///
    /// Terminal conditions (missing row, stale token, lapsed window,
    /// challenge mismatch) return `Ok` so the queue does not retry them;
    /// network-level failures surface as errors and ride the backoff.
    pub async fn handle(
        &self,
        subscription_id: Uuid,
        mode: VerificationMode,
        token: &str,
        challenge: &str,
        topic: &str,
        lease_seconds: Option<u32>,
    ) -> Result<()> {
        let Some((sub, _)) = self.store.get_subscription(subscription_id).await? else {
            tracing::debug!(subscription_id = %subscription_id, "Verification for missing row, dropping");
            return Ok(());
        };

        if sub.verification_token.as_deref() != Some(token) {
            tracing::debug!(
                subscription_id = %subscription_id,
                "Stale verification token, dropping"
            );
            return Ok(());
        }

        if let Some(expires) = sub.verification_expires {
            if expires < chrono::Utc::now() {
                tracing::info!(
                    subscription_id = %subscription_id,
                    mode = %mode,
                    "Verification window lapsed, leaving row for sweep"
                );
                return Ok(());
            }
        }

        let echo = self
            .challenge_round_trip(&sub.callback, mode, topic, challenge, lease_seconds)
            .await;

        match echo {
            Ok(body) if body.trim() == challenge => match mode {
                VerificationMode::Subscribe => {
                    self.confirm_subscribe(subscription_id, token, lease_seconds)
                        .await
                }
                VerificationMode::Unsubscribe => {
                    tracing::info!(subscription_id = %subscription_id, "Unsubscribe confirmed");
                    self.store.delete_subscription(&sub).await
                }
            },
            Ok(body) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    mode = %mode,
                    got = %body.chars().take(64).collect::<String>(),
                    "Challenge echo mismatch"
                );
                match mode {
                    // A subscriber that answers wrongly is removed regardless
                    VerificationMode::Unsubscribe => self.store.delete_subscription(&sub).await,
                    VerificationMode::Subscribe => {
                        self.record_failure(subscription_id, "challenge mismatch")
                            .await
                    }
                }
            }
            Err(err) => {
                let subscriber_responded =
                    matches!(err, Error::Upstream { status: Some(_), .. });
                if mode == VerificationMode::Unsubscribe && subscriber_responded {
                    // The subscriber answered and did not confirm; the row
                    // goes away regardless of the status code.
                    tracing::info!(
                        subscription_id = %subscription_id,
                        error = %err,
                        "Unsubscribe verification rejected, deleting anyway"
                    );
                    self.store.delete_subscription(&sub).await
                } else if !err.is_retryable() {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        mode = %mode,
                        error = %err,
                        "Verification rejected by subscriber"
                    );
                    self.record_failure(subscription_id, err.to_string()).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn challenge_round_trip(
        &self,
        callback: &str,
        mode: VerificationMode,
        topic: &str,
        challenge: &str,
        lease_seconds: Option<u32>,
    ) -> Result<String> {
        let mut query: Vec<(&str, String)> = vec![
            ("hub.mode", mode.to_string()),
            ("hub.topic", topic.to_string()),
            ("hub.challenge", challenge.to_string()),
        ];
        if let Some(lease) = lease_seconds {
            query.push(("hub.lease_seconds", lease.to_string()));
        }

        let response = self
            .http
            .get(callback)
            .query(&query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(callback)
                } else {
                    Error::upstream_io(callback, e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::upstream(callback, status, "verification rejected"));
        }
        response
            .text()
            .await
            .map_err(|e| Error::upstream_io(callback, e.to_string()))
    }

    async fn confirm_subscribe(
        &self,
        subscription_id: Uuid,
        token: &str,
        lease_seconds: Option<u32>,
    ) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((mut sub, version)) = self.store.get_subscription(subscription_id).await?
            else {
                return Ok(());
            };
            // Another verification superseded this one in the meantime
            if sub.verification_token.as_deref() != Some(token) {
                return Ok(());
            }
            let lease = lease_seconds.unwrap_or(sub.lease_seconds);
            sub.mark_verified(lease);
            match self
                .store
                .update_subscription(&sub, version, Vec::new())
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        subscription_id = %subscription_id,
                        topic = %sub.topic,
                        lease_seconds = lease,
                        "Subscription verified"
                    );
                    return Ok(());
                }
                Err(Error::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(format!("subscriptions/{subscription_id}")))
    }

    async fn record_failure(&self, subscription_id: Uuid, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        for _ in 0..CAS_ATTEMPTS {
            let Some((mut sub, version)) = self.store.get_subscription(subscription_id).await?
            else {
                return Ok(());
            };
            sub.record_error(message.clone());
            match self
                .store
                .update_subscription(&sub, version, Vec::new())
                .await
            {
                Ok(()) => return Ok(()),
                Err(Error::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::conflict(format!("subscriptions/{subscription_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use feeder_core::model::Subscription;
    use feeder_store::MemoryBackend;
    use std::sync::Arc;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Responds with the hub.challenge query parameter, like a well-behaved
    /// subscriber.
    struct EchoChallenge;

    impl Respond for EchoChallenge {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let challenge = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "hub.challenge")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            ResponseTemplate::new(200).set_body_string(challenge)
        }
    }

    fn runner(store: Store) -> VerifyRunner {
        VerifyRunner::new(
            store,
            reqwest::Client::new(),
            Duration::from_secs(5),
        )
    }

    async fn pending_subscription(store: &Store, callback: String) -> Subscription {
        let sub = Subscription::new(
            "https://ex.com/a".into(),
            callback,
            3600,
            None,
            ChronoDuration::minutes(15),
        );
        store.insert_subscription(&sub, Vec::new()).await.unwrap();
        sub
    }

    #[tokio::test]
    async fn subscribe_happy_path_verifies_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("hub.mode", "subscribe"))
            .and(query_param("hub.topic", "https://ex.com/a"))
            .and(query_param("hub.lease_seconds", "3600"))
            .respond_with(EchoChallenge)
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = pending_subscription(&store, format!("{}/cb", server.uri())).await;
        let token = sub.verification_token.clone().unwrap();

        runner(store.clone())
            .handle(
                sub.id,
                VerificationMode::Subscribe,
                &token,
                "the-challenge",
                "https://ex.com/a",
                Some(3600),
            )
            .await
            .unwrap();

        let (verified, _) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(verified.verified);
        assert!(verified.verification_token.is_none());
        let lease_left = verified.expires - Utc::now();
        assert!(lease_left > ChronoDuration::seconds(3590));
        assert!(lease_left <= ChronoDuration::seconds(3600));
    }

    #[tokio::test]
    async fn stale_token_is_dropped_without_http() {
        // No mock server: any HTTP attempt would error
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = pending_subscription(&store, "http://127.0.0.1:9/cb".into()).await;

        runner(store.clone())
            .handle(
                sub.id,
                VerificationMode::Subscribe,
                "some-other-token",
                "challenge",
                "https://ex.com/a",
                Some(3600),
            )
            .await
            .unwrap();

        let (unchanged, _) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(!unchanged.verified);
    }

    #[tokio::test]
    async fn lapsed_window_leaves_row_for_sweep() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let mut sub = Subscription::new(
            "https://ex.com/a".into(),
            "http://127.0.0.1:9/cb".into(),
            3600,
            None,
            ChronoDuration::minutes(15),
        );
        sub.verification_expires = Some(Utc::now() - ChronoDuration::minutes(1));
        store.insert_subscription(&sub, Vec::new()).await.unwrap();
        let token = sub.verification_token.clone().unwrap();

        runner(store.clone())
            .handle(
                sub.id,
                VerificationMode::Subscribe,
                &token,
                "challenge",
                "https://ex.com/a",
                Some(3600),
            )
            .await
            .unwrap();

        let (unchanged, _) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(!unchanged.verified);
    }

    #[tokio::test]
    async fn challenge_mismatch_leaves_subscribe_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("zzz"))
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = pending_subscription(&store, format!("{}/cb", server.uri())).await;
        let token = sub.verification_token.clone().unwrap();

        runner(store.clone())
            .handle(
                sub.id,
                VerificationMode::Subscribe,
                &token,
                "expected",
                "https://ex.com/a",
                Some(3600),
            )
            .await
            .unwrap();

        let (row, _) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert!(!row.verified);
        assert_eq!(row.error_count, 1);
        assert!(row.last_error.as_deref().unwrap().contains("mismatch"));
    }

    #[tokio::test]
    async fn unsubscribe_deletes_even_on_500() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = pending_subscription(&store, format!("{}/cb", server.uri())).await;
        let token = sub.verification_token.clone().unwrap();

        runner(store.clone())
            .handle(
                sub.id,
                VerificationMode::Unsubscribe,
                &token,
                "challenge",
                "https://ex.com/a",
                None,
            )
            .await
            .unwrap();

        assert!(store.get_subscription(sub.id).await.unwrap().is_none());
        assert!(store
            .find_subscription("https://ex.com/a", &sub.callback)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unsubscribe_confirmed_deletes_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("hub.mode", "unsubscribe"))
            .respond_with(EchoChallenge)
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = pending_subscription(&store, format!("{}/cb", server.uri())).await;
        let token = sub.verification_token.clone().unwrap();

        runner(store.clone())
            .handle(
                sub.id,
                VerificationMode::Unsubscribe,
                &token,
                "challenge",
                "https://ex.com/a",
                None,
            )
            .await
            .unwrap();

        assert!(store.get_subscription(sub.id).await.unwrap().is_none());
    }
}
