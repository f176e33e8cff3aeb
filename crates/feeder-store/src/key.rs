//! Tuple keys for the key/value store.
//!
//! Keys are sequences of string segments joined with an ASCII unit separator.
//! The separator never occurs in URLs or UUIDs, so URL-bearing segments
//! cannot collide, and a prefix of segments is always a prefix of the encoded
//! string, which keeps range scans simple.

use std::fmt;
use uuid::Uuid;

const SEPARATOR: char = '\u{1f}';

/// An encoded tuple key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KvKey(String);

impl KvKey {
    /// Build a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut encoded = String::new();
        for (i, segment) in segments.into_iter().enumerate() {
            if i > 0 {
                encoded.push(SEPARATOR);
            }
            encoded.push_str(segment.as_ref());
        }
        KvKey(encoded)
    }

    /// Build a prefix that matches every key extending these segments.
    pub fn prefix<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = Self::new(segments);
        key.0.push(SEPARATOR);
        key
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Render the separator visibly for logs
        write!(f, "{}", self.0.replace(SEPARATOR, "/"))
    }
}

/// The persisted key families.
///
/// One constructor per row or index family; nothing else in the codebase
/// builds raw keys.
pub mod keys {
    use super::*;

    pub fn subscription(id: Uuid) -> KvKey {
        KvKey::new(["subscriptions", &id.to_string()])
    }

    pub fn subscription_by_topic_callback(topic: &str, callback: &str) -> KvKey {
        KvKey::new(["subscriptions_by_topic_callback", topic, callback])
    }

    /// Prefix over every callback subscribed to `topic`.
    pub fn subscriptions_for_topic(topic: &str) -> KvKey {
        KvKey::prefix(["subscriptions_by_topic_callback", topic])
    }

    pub fn all_subscriptions() -> KvKey {
        KvKey::prefix(["subscriptions"])
    }

    pub fn feed(id: Uuid) -> KvKey {
        KvKey::new(["feeds", &id.to_string()])
    }

    pub fn feed_by_url(url: &str) -> KvKey {
        KvKey::new(["feeds_by_url", url])
    }

    pub fn all_feeds() -> KvKey {
        KvKey::prefix(["feeds"])
    }

    pub fn feed_item(id: Uuid) -> KvKey {
        KvKey::new(["feed_items", &id.to_string()])
    }

    pub fn feed_item_by_guid(feed_id: Uuid, guid: &str) -> KvKey {
        KvKey::new(["feed_items_by_feed_guid", &feed_id.to_string(), guid])
    }

    /// Prefix over every item guid of one feed.
    pub fn feed_items_for_feed(feed_id: Uuid) -> KvKey {
        KvKey::prefix(["feed_items_by_feed_guid", &feed_id.to_string()])
    }

    pub fn external_subscription(id: Uuid) -> KvKey {
        KvKey::new(["external_subscriptions", &id.to_string()])
    }

    pub fn external_subscription_by_topic(topic: &str) -> KvKey {
        KvKey::new(["external_subscriptions_by_topic", topic])
    }

    pub fn external_subscription_by_callback(callback_path: &str) -> KvKey {
        KvKey::new(["external_subscriptions_by_callback", callback_path])
    }

    pub fn all_external_subscriptions() -> KvKey {
        KvKey::prefix(["external_subscriptions"])
    }

    pub fn user_callback(id: Uuid) -> KvKey {
        KvKey::new(["user_callbacks", &id.to_string()])
    }

    pub fn user_callback_by_topic_url(topic: &str, url: &str) -> KvKey {
        KvKey::new(["user_callbacks_by_topic_url", topic, url])
    }

    /// Prefix over every callback URL registered for `topic`.
    pub fn user_callbacks_for_topic(topic: &str) -> KvKey {
        KvKey::prefix(["user_callbacks_by_topic_url", topic])
    }

    pub fn all_user_callbacks() -> KvKey {
        KvKey::prefix(["user_callbacks"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_segments_cannot_collide() {
        // Slashes inside URLs must not create fake tuple boundaries
        let a = keys::subscription_by_topic_callback("https://ex.com/a", "https://cb.ex/x");
        let b = keys::subscription_by_topic_callback("https://ex.com", "/a\u{2044}https://cb.ex/x");
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_matches_extensions_only() {
        let topic = "https://ex.com/a";
        let row = keys::subscription_by_topic_callback(topic, "https://cb.ex/x");
        let prefix = keys::subscriptions_for_topic(topic);
        assert!(row.as_str().starts_with(prefix.as_str()));

        // A longer topic sharing the prefix string must not match
        let other = keys::subscription_by_topic_callback("https://ex.com/ab", "https://cb.ex/x");
        assert!(!other.as_str().starts_with(prefix.as_str()));
    }

    #[test]
    fn display_is_readable() {
        let id = Uuid::nil();
        assert_eq!(
            keys::feed(id).to_string(),
            format!("feeds/{id}")
        );
    }
}
