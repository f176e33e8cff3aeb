//! Relay of upstream content to user callbacks.

use feeder_core::{Error, Result, TOPIC_HEADER};
use std::time::Duration;
use uuid::Uuid;

use feeder_store::Store;

const CAS_ATTEMPTS: u32 = 3;

/// Queue handler for `RelayToUserCallback` messages.
#[derive(Clone)]
pub struct RelayRunner {
    store: Store,
    http: reqwest::Client,
    timeout: Duration,
}

impl RelayRunner {
    pub fn new(store: Store, http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            store,
            http,
            timeout,
        }
    }

    /// Forward one payload to one user callback.
    pub async fn handle(
        &self,
        user_callback_id: Uuid,
        topic: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<()> {
        let Some((cb, _)) = self.store.get_user_callback(user_callback_id).await? else {
            tracing::debug!(
                user_callback_id = %user_callback_id,
                "Relay for missing user callback, dropping"
            );
            return Ok(());
        };
        if !cb.verified {
            tracing::debug!(
                user_callback_id = %user_callback_id,
                "Relay for unverified user callback, dropping"
            );
            return Ok(());
        }

        let outcome = self
            .http
            .post(&cb.callback_url)
            .header("Content-Type", content_type)
            .header(TOPIC_HEADER, topic)
            .timeout(self.timeout)
            .body(body.to_vec())
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    user_callback_id = %user_callback_id,
                    callback = %cb.callback_url,
                    bytes = body.len(),
                    "Content relayed"
                );
                self.mutate(user_callback_id, |cb| cb.record_use()).await
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let err = Error::upstream(&cb.callback_url, status, "relay rejected");
                self.mutate(user_callback_id, |cb| cb.record_error(err.to_string()))
                    .await?;
                Err(err)
            }
            Err(send_err) => {
                let err = if send_err.is_timeout() {
                    Error::timeout(&cb.callback_url)
                } else {
                    Error::upstream_io(&cb.callback_url, send_err.to_string())
                };
                self.mutate(user_callback_id, |cb| cb.record_error(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    async fn mutate(
        &self,
        id: Uuid,
        apply: impl Fn(&mut feeder_core::model::UserCallback),
    ) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let Some((mut cb, version)) = self.store.get_user_callback(id).await? else {
                return Ok(());
            };
            apply(&mut cb);
            match self.store.update_user_callback(&cb, version).await {
                Ok(()) => return Ok(()),
                Err(Error::Conflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feeder_core::model::UserCallback;
    use feeder_store::MemoryBackend;
    use std::sync::Arc;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runner(store: Store) -> RelayRunner {
        RelayRunner::new(store, reqwest::Client::new(), Duration::from_secs(5))
    }

    async fn verified_callback(store: &Store, url: String) -> UserCallback {
        let mut cb = UserCallback::new("https://ex.com/a".into(), url);
        cb.mark_verified();
        store.insert_user_callback(&cb).await.unwrap();
        cb
    }

    #[tokio::test]
    async fn relays_with_topic_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-SuperDuperFeeder-Topic", "https://ex.com/a"))
            .and(header("Content-Type", "application/atom+xml"))
            .and(body_bytes(b"<atom/>".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let cb = verified_callback(&store, format!("{}/hook", server.uri())).await;

        runner(store.clone())
            .handle(cb.id, "https://ex.com/a", "application/atom+xml", b"<atom/>")
            .await
            .unwrap();

        let (row, _) = store.get_user_callback(cb.id).await.unwrap().unwrap();
        assert!(row.last_used.is_some());
        assert_eq!(row.error_count, 0);
    }

    #[tokio::test]
    async fn failure_records_error_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = Store::new(Arc::new(MemoryBackend::new()));
        let cb = verified_callback(&store, format!("{}/hook", server.uri())).await;

        let err = runner(store.clone())
            .handle(cb.id, "https://ex.com/a", "text/plain", b"x")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let (row, _) = store.get_user_callback(cb.id).await.unwrap().unwrap();
        assert_eq!(row.error_count, 1);
        assert!(row.last_used.is_none());
    }

    #[tokio::test]
    async fn unverified_callback_is_skipped() {
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let cb = UserCallback::new("https://ex.com/a".into(), "http://127.0.0.1:9/hook".into());
        store.insert_user_callback(&cb).await.unwrap();

        runner(store.clone())
            .handle(cb.id, "https://ex.com/a", "text/plain", b"x")
            .await
            .unwrap();
    }
}
