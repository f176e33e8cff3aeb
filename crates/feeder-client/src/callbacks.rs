//! User-callback verification.
//!
//! A user proves ownership of a callback URL by echoing a token:
//! `GET <callback>?mode=verify&token=<X>` must answer `200 <X>`. Tokens
//! live 24 hours; rows that never verify are purged by the sweep. The
//! `/api/webhook/verify/:token` endpoint is the manual confirmation path.

use chrono::Utc;
use feeder_core::model::UserCallback;
use feeder_core::{Error, Result};
use feeder_store::Store;
use std::time::Duration;

const VERIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the token round-trip against a callback URL.
///
/// Returns true when the callback echoed the token and the row is now
/// verified. A failed round-trip leaves the row pending so the owner can
/// still confirm manually.
pub async fn send_verification(
    store: &Store,
    http: &reqwest::Client,
    cb: UserCallback,
) -> Result<bool> {
    let Some(token) = cb.verification_token.clone() else {
        return Ok(cb.verified);
    };

    let echoed = match http
        .get(&cb.callback_url)
        .query(&[("mode", "verify"), ("token", token.as_str())])
        .timeout(VERIFICATION_TIMEOUT)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            response.text().await.ok().map(|body| body.trim() == token)
        }
        Ok(response) => {
            tracing::debug!(
                callback = %cb.callback_url,
                status = response.status().as_u16(),
                "User callback verification rejected"
            );
            Some(false)
        }
        Err(err) => {
            tracing::debug!(
                callback = %cb.callback_url,
                error = %err,
                "User callback verification unreachable"
            );
            None
        }
    };

    if echoed != Some(true) {
        return Ok(false);
    }

    mark_verified(store, cb.id).await?;
    Ok(true)
}

/// Confirm a callback by its token, the `/api/webhook/verify/:token` path.
pub async fn confirm_by_token(store: &Store, token: &str) -> Result<Option<UserCallback>> {
    // Tokens carry no index; the table is small and rows expire in a day.
    for (cb, _) in store.list_user_callbacks().await? {
        if cb.verification_token.as_deref() == Some(token) {
            if cb
                .verification_expires
                .map(|expires| expires < Utc::now())
                .unwrap_or(false)
            {
                return Ok(None);
            }
            mark_verified(store, cb.id).await?;
            let (confirmed, _) = store
                .get_user_callback(cb.id)
                .await?
                .ok_or_else(|| Error::storage("user callback vanished during confirmation"))?;
            return Ok(Some(confirmed));
        }
    }
    Ok(None)
}

async fn mark_verified(store: &Store, id: uuid::Uuid) -> Result<()> {
    loop {
        let Some((mut cb, version)) = store.get_user_callback(id).await? else {
            return Ok(());
        };
        if cb.verified {
            return Ok(());
        }
        cb.mark_verified();
        match store.update_user_callback(&cb, version).await {
            Ok(()) => {
                tracing::info!(
                    user_callback_id = %id,
                    topic = %cb.topic,
                    "User callback verified"
                );
                return Ok(());
            }
            Err(Error::Conflict { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Purge unverified callbacks whose token lapsed.
pub async fn cleanup_expired_verifications(store: &Store) -> Result<usize> {
    let now = Utc::now();
    let mut purged = 0;
    for (cb, _) in store.list_user_callbacks().await? {
        if cb.verification_lapsed(now) {
            store.delete_user_callback(&cb).await?;
            purged += 1;
            tracing::debug!(
                user_callback_id = %cb.id,
                topic = %cb.topic,
                "Purged user callback with lapsed verification"
            );
        }
    }
    if purged > 0 {
        tracing::info!(count = purged, "Swept expired user-callback verifications");
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use feeder_store::MemoryBackend;
    use std::sync::Arc;
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct EchoToken;

    impl Respond for EchoToken {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let token = request
                .url
                .query_pairs()
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.to_string())
                .unwrap_or_default();
            ResponseTemplate::new(200).set_body_string(token)
        }
    }

    fn store() -> Store {
        Store::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn echoing_callback_verifies() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::query_param("mode", "verify"))
            .respond_with(EchoToken)
            .mount(&server)
            .await;

        let store = store();
        let cb = UserCallback::new("https://ex.com/a".into(), format!("{}/hook", server.uri()));
        store.insert_user_callback(&cb).await.unwrap();

        let verified = send_verification(&store, &reqwest::Client::new(), cb.clone())
            .await
            .unwrap();
        assert!(verified);

        let (row, _) = store.get_user_callback(cb.id).await.unwrap().unwrap();
        assert!(row.verified);
        assert!(row.verification_token.is_none());
    }

    #[tokio::test]
    async fn wrong_echo_stays_pending() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("nope"))
            .mount(&server)
            .await;

        let store = store();
        let cb = UserCallback::new("https://ex.com/a".into(), format!("{}/hook", server.uri()));
        store.insert_user_callback(&cb).await.unwrap();

        let verified = send_verification(&store, &reqwest::Client::new(), cb.clone())
            .await
            .unwrap();
        assert!(!verified);

        let (row, _) = store.get_user_callback(cb.id).await.unwrap().unwrap();
        assert!(!row.verified);
        assert!(row.verification_token.is_some());
    }

    #[tokio::test]
    async fn manual_confirmation_by_token() {
        let store = store();
        let cb = UserCallback::new("https://ex.com/a".into(), "https://user.ex/hook".into());
        let token = cb.verification_token.clone().unwrap();
        store.insert_user_callback(&cb).await.unwrap();

        let confirmed = confirm_by_token(&store, &token).await.unwrap().unwrap();
        assert!(confirmed.verified);

        // Unknown tokens confirm nothing
        assert!(confirm_by_token(&store, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_token_cannot_confirm() {
        let store = store();
        let mut cb = UserCallback::new("https://ex.com/a".into(), "https://user.ex/hook".into());
        cb.verification_expires = Some(Utc::now() - ChronoDuration::hours(1));
        let token = cb.verification_token.clone().unwrap();
        store.insert_user_callback(&cb).await.unwrap();

        assert!(confirm_by_token(&store, &token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_purges_only_lapsed_unverified() {
        let store = store();

        let mut lapsed = UserCallback::new("https://ex.com/a".into(), "https://u1.ex/h".into());
        lapsed.verification_expires = Some(Utc::now() - ChronoDuration::hours(1));
        store.insert_user_callback(&lapsed).await.unwrap();

        let pending = UserCallback::new("https://ex.com/a".into(), "https://u2.ex/h".into());
        store.insert_user_callback(&pending).await.unwrap();

        let mut verified = UserCallback::new("https://ex.com/a".into(), "https://u3.ex/h".into());
        verified.mark_verified();
        store.insert_user_callback(&verified).await.unwrap();

        let purged = cleanup_expired_verifications(&store).await.unwrap();
        assert_eq!(purged, 1);

        assert!(store.get_user_callback(lapsed.id).await.unwrap().is_none());
        assert!(store.get_user_callback(pending.id).await.unwrap().is_some());
        assert!(store.get_user_callback(verified.id).await.unwrap().is_some());
    }
}
