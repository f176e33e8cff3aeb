//! Persisted domain entities.
//!
//! Every entity is a plain serde struct stored as a JSON value in the typed
//! key/value store; secondary index keys are maintained by `feeder-store`.
//! Times are UTC instants, ids are random UUIDs rendered canonically.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a random URL-safe token for challenges and verification.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// An inbound subscription owned by this hub.
///
/// Created unverified; a successful challenge round-trip flips `verified`
/// exactly once. Rows past `expires` plus grace are swept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    /// Topic URL the subscriber follows
    pub topic: String,
    /// Subscriber callback URL
    pub callback: String,
    /// Shared secret for `X-Hub-Signature`, at most 200 bytes
    pub secret: Option<String>,
    pub lease_seconds: u32,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub verified: bool,
    /// Pending verification token; cleared when verified
    pub verification_token: Option<String>,
    pub verification_expires: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Create a new pending subscription with a fresh verification token.
    pub fn new(
        topic: String,
        callback: String,
        lease_seconds: u32,
        secret: Option<String>,
        verification_window: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            topic,
            callback,
            secret,
            lease_seconds,
            created: now,
            expires: now + Duration::seconds(i64::from(lease_seconds)),
            verified: false,
            verification_token: Some(random_token()),
            verification_expires: Some(now + verification_window),
            error_count: 0,
            last_error: None,
            last_error_time: None,
        }
    }

    /// Mark verified: clear the pending token and restart the lease clock.
    pub fn mark_verified(&mut self, lease_seconds: u32) {
        let now = Utc::now();
        self.verified = true;
        self.lease_seconds = lease_seconds;
        self.expires = now + Duration::seconds(i64::from(lease_seconds));
        self.verification_token = None;
        self.verification_expires = None;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.last_error_time = Some(Utc::now());
    }
}

/// A polled source of record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feed {
    pub id: Uuid,
    /// Feed URL, unique across the store
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    /// Last time new content was observed
    pub last_updated: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// RFC 1123 string as received, replayed in `If-Modified-Since`
    pub last_modified: Option<String>,
    pub polling_interval_minutes: u32,
    pub active: bool,
    /// True once a `rel=hub` link was seen; removes the feed from polling
    pub supports_websub: bool,
    pub websub_hub: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    /// Guid of the newest entry processed last cycle
    pub last_processed_entry_id: Option<String>,
    pub created: DateTime<Utc>,
}

impl Feed {
    pub fn new(url: String, polling_interval_minutes: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            title: None,
            description: None,
            last_fetched: None,
            last_updated: None,
            etag: None,
            last_modified: None,
            polling_interval_minutes,
            active: true,
            supports_websub: false,
            websub_hub: None,
            error_count: 0,
            last_error: None,
            last_error_time: None,
            last_processed_entry_id: None,
            created: Utc::now(),
        }
    }

    /// Whether this feed belongs to the polling due-set at `now`.
    ///
    /// WebSub-capable feeds never poll; jitter is applied by the caller.
    pub fn is_due(&self, now: DateTime<Utc>, jitter: Duration) -> bool {
        if !self.active || self.supports_websub {
            return false;
        }
        match self.last_fetched {
            None => true,
            Some(fetched) => {
                fetched - jitter + Duration::minutes(i64::from(self.polling_interval_minutes))
                    <= now
            }
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.last_error_time = Some(Utc::now());
    }

    pub fn clear_errors(&mut self) {
        self.error_count = 0;
        self.last_error = None;
        self.last_error_time = None;
    }
}

/// One observed entry of a feed, unique per `(feed_id, guid)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedItem {
    pub id: Uuid,
    pub feed_id: Uuid,
    /// Stable identifier within the feed: the entry id, else its first link
    pub guid: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
}

/// An outbound subscription where this hub acts as the subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalSubscription {
    pub id: Uuid,
    pub topic: String,
    /// Upstream hub URL; absent for polling-fallback subscriptions
    pub hub: Option<String>,
    /// Local callback path (`/callback/<uuid>`), unique per process
    pub callback_path: String,
    pub secret: String,
    pub lease_seconds: u32,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub verified: bool,
    pub last_renewed: Option<DateTime<Utc>>,
    /// True iff no external hub was found and polling substitutes for it
    pub using_fallback: bool,
    pub user_callback_url: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl ExternalSubscription {
    /// A subscription against a discovered upstream hub, pending verification.
    pub fn to_hub(topic: String, hub: String, lease_seconds: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            topic,
            hub: Some(hub),
            callback_path: format!("/callback/{}", Uuid::new_v4()),
            secret: random_token(),
            lease_seconds,
            created: now,
            expires: now + Duration::seconds(i64::from(lease_seconds)),
            verified: false,
            last_renewed: None,
            using_fallback: false,
            user_callback_url: None,
            error_count: 0,
            last_error: None,
            last_error_time: None,
        }
    }

    /// A polling-fallback subscription; polling is the verification.
    pub fn fallback(topic: String, lease_seconds: u32) -> Self {
        let mut sub = Self::to_hub(topic, String::new(), lease_seconds);
        sub.hub = None;
        sub.using_fallback = true;
        sub.verified = true;
        sub
    }

    /// Whether this subscription should renew inside the given window.
    pub fn needs_renewal(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.verified && self.expires <= now + window
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.last_error_time = Some(Utc::now());
    }
}

/// An external URL that wants content forwarded to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserCallback {
    pub id: Uuid,
    pub topic: String,
    pub callback_url: String,
    pub verified: bool,
    pub verification_token: Option<String>,
    pub verification_expires: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl UserCallback {
    /// Verification tokens live this long before the row is purged.
    pub const TOKEN_TTL_HOURS: i64 = 24;

    pub fn new(topic: String, callback_url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            callback_url,
            verified: false,
            verification_token: Some(random_token()),
            verification_expires: Some(Utc::now() + Duration::hours(Self::TOKEN_TTL_HOURS)),
            last_used: None,
            error_count: 0,
            last_error: None,
            last_error_time: None,
        }
    }

    /// Issue a fresh token, e.g. when re-sending verification.
    pub fn refresh_token(&mut self) -> String {
        let token = random_token();
        self.verification_token = Some(token.clone());
        self.verification_expires = Some(Utc::now() + Duration::hours(Self::TOKEN_TTL_HOURS));
        token
    }

    pub fn mark_verified(&mut self) {
        self.verified = true;
        self.verification_token = None;
        self.verification_expires = None;
    }

    /// True when the row never verified and its token has lapsed.
    pub fn verification_lapsed(&self, now: DateTime<Utc>) -> bool {
        !self.verified
            && self
                .verification_expires
                .map(|expires| expires < now)
                .unwrap_or(true)
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.last_error_time = Some(Utc::now());
    }

    pub fn record_use(&mut self) {
        self.last_used = Some(Utc::now());
        self.error_count = 0;
        self.last_error = None;
        self.last_error_time = None;
    }
}
