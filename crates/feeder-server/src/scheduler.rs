//! Periodic triggers.
//!
//! Three cadences feed the queue and the sweeps: the polling tick, the
//! renewal/cleanup tick, and the expiration sweep. A fourth housekeeping
//! tick re-opens stale queue leases. Ticks skip rather than stack when a
//! previous run overruns its slot.

use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::state::AppState;

/// Spawn the scheduler task.
pub fn spawn_scheduler(state: AppState, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(scheduler_loop(state, shutdown))
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn scheduler_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let cadence = &state.config.scheduler;
    let mut poll_tick = interval(cadence.poll_tick_secs);
    let mut renewal_tick = interval(cadence.renewal_tick_secs);
    let mut expiration_tick = interval(cadence.expiration_tick_secs);
    let mut lease_tick = interval(state.config.queue.visibility_timeout_secs.max(1));

    tracing::info!(
        poll_secs = cadence.poll_tick_secs,
        renewal_secs = cadence.renewal_tick_secs,
        expiration_secs = cadence.expiration_tick_secs,
        "Scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = poll_tick.tick() => poll_feeds(&state).await,
            _ = renewal_tick.tick() => {
                renew_subscriptions(&state).await;
                cleanup_expired_verifications(&state).await;
            }
            _ = expiration_tick.tick() => clear_expired_subscriptions(&state).await,
            _ = lease_tick.tick() => release_stale_leases(&state).await,
        }
    }

    tracing::info!("Scheduler stopped");
}

/// Queue a poll for every due feed.
pub async fn poll_feeds(state: &AppState) {
    match feeder_poller::enqueue_due_polls(&state.store, &state.queue, &state.config.polling).await
    {
        Ok(count) if count > 0 => tracing::debug!(count = count, "Polling tick queued feeds"),
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "Polling tick failed"),
    }
}

/// Queue renewals for expiring outbound subscriptions.
pub async fn renew_subscriptions(state: &AppState) {
    match feeder_client::renew::renew_due_subscriptions(
        &state.store,
        &state.queue,
        state.config.hub.renewal_window_minutes,
    )
    .await
    {
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "Renewal tick failed"),
    }
}

/// Purge user callbacks whose verification token lapsed.
pub async fn cleanup_expired_verifications(state: &AppState) {
    if let Err(err) = feeder_client::callbacks::cleanup_expired_verifications(&state.store).await {
        tracing::error!(error = %err, "Verification cleanup failed");
    }
}

/// Delete inbound subscriptions past expiry plus grace.
pub async fn clear_expired_subscriptions(state: &AppState) {
    let grace = ChronoDuration::hours(i64::from(state.config.hub.expiration_grace_hours));
    if let Err(err) = feeder_hub::maintenance::clear_expired_subscriptions(&state.store, grace).await
    {
        tracing::error!(error = %err, "Expiration sweep failed");
    }
}

async fn release_stale_leases(state: &AppState) {
    if let Err(err) = state
        .queue
        .release_stale(state.config.queue.visibility_timeout())
        .await
    {
        tracing::error!(error = %err, "Stale lease release failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feeder_core::config::{AppConfig, StoreBackend};
    use feeder_core::model::Feed;
    use feeder_store::MemoryBackend;
    use std::sync::Arc;

    fn state() -> AppState {
        let mut config = AppConfig::default();
        config.database.backend = StoreBackend::Memory;
        config.polling.jitter_minutes = 0;
        AppState::build(config, Arc::new(MemoryBackend::new())).unwrap()
    }

    #[tokio::test]
    async fn poll_tick_queues_due_feeds() {
        let state = state();
        let feed = Feed::new("https://ex.com/feed".into(), 60);
        state.store.insert_feed(&feed, Vec::new()).await.unwrap();

        poll_feeds(&state).await;
        assert_eq!(state.queue.pending_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let state = state();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduler(state, rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
    }
}
