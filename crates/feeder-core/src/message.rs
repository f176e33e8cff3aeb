//! Queue message union.
//!
//! Every background task the hub performs travels through the durable queue
//! as one of these tagged payloads. Handlers are idempotent: they re-read the
//! store on delivery and short-circuit when the row already reached a
//! terminal state, so at-least-once delivery never double-processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Direction of a WebSub verification round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationMode::Subscribe => write!(f, "subscribe"),
            VerificationMode::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// The tagged union routed by the queue dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    /// Trigger one poll of one feed.
    PollFeed { feed_id: Uuid },

    /// Deliver one content payload to one subscriber.
    Distribute {
        subscription_id: Uuid,
        topic: String,
        content_type: String,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },

    /// Execute a verification GET against a subscriber's callback.
    Verify {
        subscription_id: Uuid,
        mode: VerificationMode,
        /// Token minted with the pending row; stale tokens are dropped
        token: String,
        challenge: String,
        topic: String,
        lease_seconds: Option<u32>,
    },

    /// Refresh an outbound subscription before its lease lapses.
    Renew { external_subscription_id: Uuid },

    /// Forward external content to a user-provided URL.
    RelayToUserCallback {
        user_callback_id: Uuid,
        topic: String,
        content_type: String,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
}

impl TaskMessage {
    /// Stable tag for logging and metrics.
    pub fn tag(&self) -> &'static str {
        match self {
            TaskMessage::PollFeed { .. } => "poll_feed",
            TaskMessage::Distribute { .. } => "distribute",
            TaskMessage::Verify { .. } => "verify",
            TaskMessage::Renew { .. } => "renew",
            TaskMessage::RelayToUserCallback { .. } => "relay_to_user_callback",
        }
    }

    /// Per-attempt retry delays, in seconds. `attempts` may exceed the
    /// schedule length; the queue buries the message at that point.
    pub fn backoff_schedule(&self) -> &'static [u64] {
        match self {
            // Polls are rescheduled by the next tick anyway; retry gently.
            TaskMessage::PollFeed { .. } => &[60, 300],
            TaskMessage::Distribute { .. } => &[1, 10, 60, 600],
            TaskMessage::Verify { .. } => &[10, 60, 300],
            TaskMessage::Renew { .. } => &[60, 600],
            TaskMessage::RelayToUserCallback { .. } => &[5, 30, 120],
        }
    }

    /// Default total delivery attempts before the message is buried: one
    /// per scheduled delay plus the initial try. Webhook deliveries
    /// (`Distribute`, `RelayToUserCallback`) are enqueued with the
    /// configured `webhook_retries` budget instead.
    pub fn max_attempts(&self) -> u32 {
        self.backoff_schedule().len() as u32 + 1
    }

    /// Key the queue deduplicates on while a message is still pending.
    ///
    /// Only polls carry one: a feed must never have two polls in flight.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            TaskMessage::PollFeed { feed_id } => Some(format!("poll:{feed_id}")),
            _ => None,
        }
    }
}

/// Serde codec storing raw bodies as base64 inside JSON payloads.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
