//! Admin read API.
//!
//! Strictly a projection over the store plus a manual poll trigger; all
//! filter and sort semantics live here, not in the engines.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use feeder_core::message::TaskMessage;
use feeder_core::model::Feed;
use feeder_core::Error;

use crate::error::HttpResult;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/feeds", get(list_feeds))
        .route("/api/feeds/:id", get(get_feed))
        .route("/api/feeds/:id/items", get(list_feed_items))
        .route("/api/feeds/:id/toggle", post(toggle_feed))
        .route("/api/feeds/:id/poll", post(poll_feed))
}

#[derive(Debug, Default, Deserialize)]
struct FeedListQuery {
    /// active | inactive | websub | polling | error
    status: Option<String>,
    /// substring match on the feed URL
    url: Option<String>,
    /// substring match on the title
    title: Option<String>,
    /// url | title | last_fetched | last_updated | created
    sort: Option<String>,
    /// asc | desc
    order: Option<String>,
}

async fn list_feeds(
    State(state): State<AppState>,
    Query(query): Query<FeedListQuery>,
) -> HttpResult<Response> {
    let mut feeds: Vec<Feed> = state
        .store
        .list_feeds()
        .await?
        .into_iter()
        .map(|(feed, _)| feed)
        .collect();

    if let Some(status) = query.status.as_deref() {
        feeds.retain(|feed| match status {
            "active" => feed.active,
            "inactive" => !feed.active,
            "websub" => feed.supports_websub,
            "polling" => feed.active && !feed.supports_websub,
            "error" => feed.error_count > 0,
            _ => true,
        });
    }
    if let Some(url) = query.url.as_deref() {
        let needle = url.to_ascii_lowercase();
        feeds.retain(|feed| feed.url.to_ascii_lowercase().contains(&needle));
    }
    if let Some(title) = query.title.as_deref() {
        let needle = title.to_ascii_lowercase();
        feeds.retain(|feed| {
            feed.title
                .as_deref()
                .map(|t| t.to_ascii_lowercase().contains(&needle))
                .unwrap_or(false)
        });
    }

    match query.sort.as_deref().unwrap_or("created") {
        "url" => feeds.sort_by(|a, b| a.url.cmp(&b.url)),
        "title" => feeds.sort_by(|a, b| a.title.cmp(&b.title)),
        "last_fetched" => feeds.sort_by(|a, b| a.last_fetched.cmp(&b.last_fetched)),
        "last_updated" => feeds.sort_by(|a, b| a.last_updated.cmp(&b.last_updated)),
        _ => feeds.sort_by(|a, b| a.created.cmp(&b.created)),
    }
    if query.order.as_deref() == Some("desc") {
        feeds.reverse();
    }

    Ok(Json(json!({ "feeds": feeds, "total": feeds.len() })).into_response())
}

async fn get_feed(State(state): State<AppState>, Path(id): Path<Uuid>) -> HttpResult<Response> {
    let (feed, _) = state
        .store
        .get_feed(id)
        .await?
        .ok_or_else(|| Error::not_found("Feed", id))?;
    Ok(Json(feed).into_response())
}

async fn list_feed_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> HttpResult<Response> {
    if state.store.get_feed(id).await?.is_none() {
        return Err(Error::not_found("Feed", id).into());
    }
    let mut items: Vec<_> = state
        .store
        .list_feed_items(id)
        .await?
        .into_iter()
        .map(|(item, _)| item)
        .collect();
    // Newest first
    items.sort_by(|a, b| {
        b.updated
            .or(b.published)
            .cmp(&a.updated.or(a.published))
    });
    Ok(Json(json!({ "items": items, "total": items.len() })).into_response())
}

/// Flip a feed's `active` flag.
async fn toggle_feed(State(state): State<AppState>, Path(id): Path<Uuid>) -> HttpResult<Response> {
    loop {
        let (mut feed, version) = state
            .store
            .get_feed(id)
            .await?
            .ok_or_else(|| Error::not_found("Feed", id))?;
        feed.active = !feed.active;
        match state.store.update_feed(&feed, version, Vec::new()).await {
            Ok(()) => {
                tracing::info!(feed_id = %id, active = feed.active, "Feed toggled");
                return Ok(Json(feed).into_response());
            }
            Err(Error::Conflict { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Queue an immediate poll regardless of the feed's cadence.
async fn poll_feed(State(state): State<AppState>, Path(id): Path<Uuid>) -> HttpResult<Response> {
    let (feed, _) = state
        .store
        .get_feed(id)
        .await?
        .ok_or_else(|| Error::not_found("Feed", id))?;
    state
        .queue
        .push(TaskMessage::PollFeed { feed_id: feed.id })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "feedId": feed.id })),
    )
        .into_response())
}
