//! Queue worker dispatch loop.
//!
//! Workers lease messages, route them by tag to the matching handler, and
//! settle the lease. Handlers run inside their own task so a panic is
//! contained, counted against the message's retry budget, and poison
//! messages end up buried rather than looping forever.

use feeder_core::message::TaskMessage;
use feeder_core::{Error, Result};
use feeder_store::backend::QueueMessage;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::state::{AppState, Handlers};

/// Route one message to its handler.
pub async fn dispatch(handlers: &Handlers, message: &TaskMessage) -> Result<()> {
    match message {
        TaskMessage::PollFeed { feed_id } => {
            handlers.poller.handle(*feed_id).await.map(|_| ())
        }
        TaskMessage::Verify {
            subscription_id,
            mode,
            token,
            challenge,
            topic,
            lease_seconds,
        } => {
            handlers
                .verify
                .handle(*subscription_id, *mode, token, challenge, topic, *lease_seconds)
                .await
        }
        TaskMessage::Distribute {
            subscription_id,
            topic,
            content_type,
            body,
        } => {
            handlers
                .distribute
                .handle(*subscription_id, topic, content_type, body)
                .await
        }
        TaskMessage::Renew {
            external_subscription_id,
        } => handlers.renew.handle(*external_subscription_id).await,
        TaskMessage::RelayToUserCallback {
            user_callback_id,
            topic,
            content_type,
            body,
        } => {
            handlers
                .relay
                .handle(*user_callback_id, topic, content_type, body)
                .await
        }
    }
}

/// Spawn the worker pool.
pub fn spawn_workers(state: AppState, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let count = state.config.queue.workers.max(1);
    (0..count)
        .map(|worker_id| {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(worker_loop(worker_id, state, shutdown))
        })
        .collect()
}

async fn worker_loop(worker_id: usize, state: AppState, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!(worker_id = worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match state.queue.dequeue().await {
            Ok(Some(message)) => process_message(&state, message).await,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(state.config.queue.sleep_on_empty()) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                tracing::warn!(worker_id = worker_id, error = %err, "Dequeue failed");
                tokio::select! {
                    _ = tokio::time::sleep(state.config.queue.sleep_on_empty()) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    tracing::debug!(worker_id = worker_id, "Worker stopped");
}

/// Run one handler and settle the message.
pub async fn process_message(state: &AppState, message: QueueMessage) {
    let tag = message.payload.tag();
    tracing::debug!(
        message_id = %message.id,
        tag = tag,
        attempt = message.attempts,
        "Dispatching message"
    );

    let handlers = state.handlers.clone();
    let payload = message.payload.clone();
    let joined = tokio::spawn(async move { dispatch(&handlers, &payload).await }).await;

    // A panic burns one attempt like any other failure; a poison message
    // reaches the dead-letter state only after its full budget.
    let (outcome, walk_backoff): (Result<()>, bool) = match joined {
        Ok(Ok(())) => (Ok(()), false),
        Ok(Err(err)) => {
            let retryable = err.is_retryable();
            (Err(err), retryable)
        }
        Err(join_err) => (
            Err(Error::internal(format!("handler panicked: {join_err}"))),
            true,
        ),
    };

    match outcome {
        Ok(()) => {
            if let Err(err) = state.queue.complete(message.id).await {
                tracing::warn!(message_id = %message.id, error = %err, "Failed to complete message");
            }
        }
        Err(err) => {
            // Client-class terminal errors skip the backoff walk entirely
            let settled = if walk_backoff {
                state.queue.retry_or_bury(&message, &err.to_string()).await
            } else {
                state
                    .queue
                    .retry_or_bury(
                        &QueueMessage {
                            attempts: message.max_attempts,
                            ..message.clone()
                        },
                        &err.to_string(),
                    )
                    .await
            };
            match settled {
                Ok(true) => tracing::error!(
                    message_id = %message.id,
                    tag = tag,
                    attempts = message.attempts,
                    error = %err,
                    "Message buried after exhausting retries"
                ),
                Ok(false) => tracing::warn!(
                    message_id = %message.id,
                    tag = tag,
                    attempt = message.attempts,
                    error = %err,
                    "Message failed, retry scheduled"
                ),
                Err(queue_err) => tracing::error!(
                    message_id = %message.id,
                    error = %queue_err,
                    "Failed to settle message"
                ),
            }
        }
    }
}

/// Drain the queue inline until nothing is ready. Test harnesses use this;
/// production runs the spawned pool.
pub async fn drain_queue(state: &AppState) -> Result<usize> {
    let mut processed = 0;
    while let Some(message) = state.queue.dequeue().await? {
        process_message(state, message).await;
        processed += 1;
    }
    Ok(processed)
}
