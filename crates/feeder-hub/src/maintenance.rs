//! Periodic hub maintenance.

use chrono::{Duration as ChronoDuration, Utc};
use feeder_core::Result;
use feeder_store::Store;

/// Delete inbound subscriptions whose lease lapsed more than `grace` ago.
///
/// Pending rows whose verification never completed expire on the same
/// clock: their `expires` was set at creation and nothing ever advanced it.
pub async fn clear_expired_subscriptions(store: &Store, grace: ChronoDuration) -> Result<usize> {
    let threshold = Utc::now() - grace;
    let mut removed = 0;

    for (sub, _) in store.list_subscriptions().await? {
        if sub.expires < threshold {
            store.delete_subscription(&sub).await?;
            removed += 1;
            tracing::debug!(
                subscription_id = %sub.id,
                topic = %sub.topic,
                verified = sub.verified,
                "Swept expired subscription"
            );
        }
    }

    if removed > 0 {
        tracing::info!(count = removed, "Cleared expired subscriptions");
    }
    Ok(removed)
}
