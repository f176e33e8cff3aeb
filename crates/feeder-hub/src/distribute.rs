//! Content distribution.
//!
//! Executes the `Distribute` queue message: one POST of one payload to one
//! subscriber, with the WebSub `Link` headers and, when the subscription
//! holds a shared secret, an `X-Hub-Signature` HMAC over the raw body.

use feeder_core::{Error, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::Duration;
use uuid::Uuid;

use feeder_store::Store;

type HmacSha1 = Hmac<Sha1>;

const CAS_ATTEMPTS: u32 = 3;

/// Queue handler for `Distribute` messages.
#[derive(Clone)]
pub struct DistributeRunner {
    store: Store,
    http: reqwest::Client,
    hub_url: String,
    timeout: Duration,
}

impl DistributeRunner {
    pub fn new(store: Store, http: reqwest::Client, hub_url: String, timeout: Duration) -> Self {
        Self {
            store,
            http,
            hub_url,
            timeout,
        }
    }

    /// Deliver one payload to one subscriber.
    ///
    /// Errors surface to the queue so failed deliveries walk the message's
    /// backoff schedule; the error mark lands on the subscription row either
    /// way.
    pub async fn handle(
        &self,
        subscription_id: Uuid,
        topic: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<()> {
        let Some((sub, _)) = self.store.get_subscription(subscription_id).await? else {
            tracing::debug!(
                subscription_id = %subscription_id,
                "Delivery for missing subscription, dropping"
            );
            return Ok(());
        };
        if !sub.verified {
            tracing::debug!(
                subscription_id = %subscription_id,
                "Delivery for unverified subscription, dropping"
            );
            return Ok(());
        }

        let mut request = self
            .http
            .post(&sub.callback)
            .header("Content-Type", content_type)
            .header(
                "Link",
                format!("<{topic}>; rel=\"self\", <{}>; rel=\"hub\"", self.hub_url),
            )
            .timeout(self.timeout)
            .body(body.to_vec());

        if let Some(secret) = &sub.secret {
            request = request.header("X-Hub-Signature", signature_header(secret, body));
        }

        let outcome = request.send().await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    subscription_id = %subscription_id,
                    callback = %sub.callback,
                    bytes = body.len(),
                    "Content delivered"
                );
                if sub.error_count > 0 {
                    self.clear_errors(subscription_id).await?;
                }
                Ok(())
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let err = Error::upstream(&sub.callback, status, "delivery rejected");
                self.mark_error(subscription_id, &err.to_string()).await?;
                Err(err)
            }
            Err(send_err) => {
                let err = if send_err.is_timeout() {
                    Error::timeout(&sub.callback)
                } else {
                    Error::upstream_io(&sub.callback, send_err.to_string())
                };
                self.mark_error(subscription_id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn mark_error(&self, subscription_id: Uuid, message: &str) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((mut sub, version)) = self.store.get_subscription(subscription_id).await?
            else {
                return Ok(());
            };
            sub.record_error(message);
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
        Ok(())
    }

    async fn clear_errors(&self, subscription_id: Uuid) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((mut sub, version)) = self.store.get_subscription(subscription_id).await?
            else {
                return Ok(());
            };
            sub.error_count = 0;
            sub.last_error = None;
            sub.last_error_time = None;
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
        Ok(())
    }
}

/// `sha1=<hex HMAC-SHA1(secret, body)>` as WebSub specifies.
pub fn signature_header(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use feeder_core::model::Subscription;
    use feeder_store::MemoryBackend;
    use std::sync::Arc;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runner(store: Store) -> DistributeRunner {
        DistributeRunner::new(
            store,
            reqwest::Client::new(),
            "https://hub.example".into(),
            Duration::from_secs(5),
        )
    }

    async fn verified_subscription(
        store: &Store,
        callback: String,
        secret: Option<String>,
    ) -> Subscription {
        let mut sub = Subscription::new(
            "https://ex.com/a".into(),
            callback,
            3600,
            secret,
            ChronoDuration::minutes(15),
        );
        sub.mark_verified(3600);
        store.insert_subscription(&sub, Vec::new()).await.unwrap();
        sub
    }

    #[test]
    fn signature_matches_known_vector() {
        // RFC 2202 test case 2
        let sig = signature_header("Jefe", b"what do ya want for nothing?");
        assert_eq!(sig, "sha1=effcdf6ae5eb2fa2d27416d5f184df9c259a7c79");
    }

    #[tokio::test]
    async fn delivers_with_link_header_and_verbatim_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cb"))
            .and(header("Content-Type", "application/rss+xml"))
            .and(header(
                "Link",
                "<https://ex.com/a>; rel=\"self\", <https://hub.example>; rel=\"hub\"",
            ))
            .and(body_bytes(b"<rss>payload</rss>".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = verified_subscription(&store, format!("{}/cb", server.uri()), None).await;

        runner(store.clone())
            .handle(
                sub.id,
                "https://ex.com/a",
                "application/rss+xml",
                b"<rss>payload</rss>",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn secret_adds_signature_header() {
        let server = MockServer::start().await;
        let expected = signature_header("s3cret", b"body");
        Mock::given(method("POST"))
            .and(header("X-Hub-Signature", expected.as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = verified_subscription(
            &store,
            format!("{}/cb", server.uri()),
            Some("s3cret".into()),
        )
        .await;

        runner(store.clone())
            .handle(sub.id, "https://ex.com/a", "text/plain", b"body")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failure_marks_row_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = verified_subscription(&store, format!("{}/cb", server.uri()), None).await;

        let err = runner(store.clone())
            .handle(sub.id, "https://ex.com/a", "text/plain", b"x")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let (row, _) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(row.error_count, 1);
        assert!(row.last_error.is_some());
    }

    #[tokio::test]
    async fn success_resets_previous_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let mut sub = Subscription::new(
            "https://ex.com/a".into(),
            format!("{}/cb", server.uri()),
            3600,
            None,
            ChronoDuration::minutes(15),
        );
        sub.mark_verified(3600);
        sub.record_error("old failure");
        store.insert_subscription(&sub, Vec::new()).await.unwrap();

        runner(store.clone())
            .handle(sub.id, "https://ex.com/a", "text/plain", b"x")
            .await
            .unwrap();

        let (row, _) = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(row.error_count, 0);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn unverified_subscription_is_skipped() {
        // No server: a POST attempt would fail the test with an Err
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let sub = Subscription::new(
            "https://ex.com/a".into(),
            "http://127.0.0.1:9/cb".into(),
            3600,
            None,
            ChronoDuration::minutes(15),
        );
        store.insert_subscription(&sub, Vec::new()).await.unwrap();

        runner(store.clone())
            .handle(sub.id, "https://ex.com/a", "text/plain", b"x")
            .await
            .unwrap();
    }
}
