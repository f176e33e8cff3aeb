//! Route definitions and request handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tower_http::trace::TraceLayer;

use feeder_client::{callbacks, CallbackOutcome};
use feeder_core::message::VerificationMode;
use feeder_core::Error;
use feeder_feed::fetch::parse_link_header;
use feeder_hub::SubscriptionRequest;

use crate::admin;
use crate::error::{HttpError, HttpResult};
use crate::state::AppState;

/// Create the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // The WebSub hub endpoint
        .route("/", post(hub_endpoint))
        // Subscriber conveniences
        .route("/api/subscribe", post(api_subscribe))
        .route("/api/unsubscribe", post(api_unsubscribe))
        // High-level webhook API
        .route("/api/webhook", post(api_webhook))
        .route("/api/webhook/verify/:token", get(api_webhook_verify))
        // Upstream hub callbacks
        .route(
            "/callback/:id",
            get(callback_verification).post(callback_content),
        )
        // Admin read API
        .merge(admin::routes())
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn accepted(body: serde_json::Value) -> Response {
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

/// `POST /`: the union endpoint publishers and subscribers talk to.
///
/// Dispatch order: a `Link: <…>; rel="self"` header marks a direct content
/// notification; otherwise a form body carries `hub.mode` (subscribe,
/// unsubscribe, publish) or a bare `topic` field naming the content's topic.
async fn hub_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Response> {
    if let Some(topic) = link_self_topic(&headers) {
        let content_type = content_type_or_rss(&headers);
        let count = state
            .hub
            .process_content_notification(&topic, body.to_vec(), content_type)
            .await?;
        return Ok(accepted(json!({ "success": true, "distributed": count })));
    }

    if !is_form_encoded(&headers) {
        return Err(Error::invalid_input(
            "body",
            "expected application/x-www-form-urlencoded or a Link header",
        )
        .into());
    }

    let form = parse_form(&body);
    match form.get("hub.mode").map(String::as_str) {
        Some(mode @ ("subscribe" | "unsubscribe")) => {
            let request = SubscriptionRequest {
                mode: if mode == "subscribe" {
                    VerificationMode::Subscribe
                } else {
                    VerificationMode::Unsubscribe
                },
                topic: required_field(&form, "hub.topic")?,
                callback: required_field(&form, "hub.callback")?,
                lease_seconds: parse_lease(&form)?,
                secret: form.get("hub.secret").cloned(),
            };
            let outcome = state.hub.process_subscription_request(request).await?;
            Ok(accepted(json!({
                "success": true,
                "subscriptionId": outcome.subscription_id,
            })))
        }
        Some("publish") => {
            let topic = required_field(&form, "hub.topic")?;
            let count = state.hub.process_publish_request(&topic).await?;
            Ok(accepted(json!({ "success": true, "distributed": count })))
        }
        Some(other) => {
            Err(Error::invalid_input("hub.mode", format!("unsupported mode {other:?}")).into())
        }
        None => {
            // Form field named "topic", read literally
            let Some(topic) = form.get("topic") else {
                return Err(Error::invalid_input(
                    "hub.mode",
                    "missing hub.mode and no topic present",
                )
                .into());
            };
            let content_type = content_type_or_rss(&headers);
            let count = state
                .hub
                .process_content_notification(topic, body.to_vec(), content_type)
                .await?;
            Ok(accepted(json!({ "success": true, "distributed": count })))
        }
    }
}

/// Form shape shared by `/api/subscribe` and `/api/unsubscribe`.
#[derive(Debug, Deserialize)]
struct HubApiForm {
    #[serde(rename = "hub.topic")]
    topic: String,
    #[serde(rename = "hub.callback")]
    callback: String,
    #[serde(rename = "hub.lease_seconds")]
    lease_seconds: Option<u32>,
    #[serde(rename = "hub.secret")]
    secret: Option<String>,
}

async fn api_subscribe(
    State(state): State<AppState>,
    axum::extract::Form(form): axum::extract::Form<HubApiForm>,
) -> HttpResult<Response> {
    let outcome = state
        .hub
        .process_subscription_request(SubscriptionRequest {
            mode: VerificationMode::Subscribe,
            topic: form.topic,
            callback: form.callback,
            lease_seconds: form.lease_seconds,
            secret: form.secret,
        })
        .await?;
    Ok(accepted(json!({
        "success": true,
        "subscriptionId": outcome.subscription_id,
    })))
}

async fn api_unsubscribe(
    State(state): State<AppState>,
    axum::extract::Form(form): axum::extract::Form<HubApiForm>,
) -> HttpResult<Response> {
    let outcome = state
        .hub
        .process_subscription_request(SubscriptionRequest {
            mode: VerificationMode::Unsubscribe,
            topic: form.topic,
            callback: form.callback,
            lease_seconds: None,
            secret: None,
        })
        .await?;
    Ok(accepted(json!({
        "success": true,
        "subscriptionId": outcome.subscription_id,
    })))
}

#[derive(Debug, Deserialize)]
struct WebhookForm {
    topic: String,
    callback: Option<String>,
}

/// `POST /api/webhook`: discover the topic's hub, subscribe there (or fall
/// back to polling) and relay content to the given callback.
async fn api_webhook(
    State(state): State<AppState>,
    axum::extract::Form(form): axum::extract::Form<WebhookForm>,
) -> HttpResult<Response> {
    let outcome = state
        .client
        .subscribe_to_feed(&form.topic, form.callback.as_deref())
        .await?;

    let message = if outcome.using_fallback {
        "Subscribed via polling fallback"
    } else if outcome.pending_verification {
        "Subscribed at upstream hub, verification pending"
    } else {
        "Subscribed"
    };

    Ok(accepted(json!({
        "success": true,
        "message": message,
        "subscriptionId": outcome.subscription_id,
        "usingFallback": outcome.using_fallback,
        "pendingVerification": outcome.pending_verification,
        "callbackPendingVerification": outcome.user_callback_pending,
    })))
}

/// `GET /api/webhook/verify/:token`: manual user-callback confirmation.
async fn api_webhook_verify(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> HttpResult<Response> {
    match callbacks::confirm_by_token(&state.store, &token).await? {
        Some(cb) => Ok(Json(json!({
            "success": true,
            "topic": cb.topic,
            "callbackUrl": cb.callback_url,
        }))
        .into_response()),
        None => Err(Error::not_found("UserCallback", "token").into()),
    }
}

/// `GET /callback/:id`: upstream hub verification of our subscription.
async fn callback_verification(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> HttpResult<Response> {
    let callback_path = format!("/callback/{id}");
    let lease_seconds = params
        .get("hub.lease_seconds")
        .map(|raw| {
            raw.parse::<u32>()
                .map_err(|_| Error::invalid_input("hub.lease_seconds", "not an integer"))
        })
        .transpose()?;

    let outcome = state
        .client
        .handle_callback(
            &callback_path,
            params.get("hub.mode").map(String::as_str),
            params.get("hub.topic").map(String::as_str),
            params.get("hub.challenge").map(String::as_str),
            lease_seconds,
            None,
        )
        .await?;

    match outcome {
        CallbackOutcome::ChallengeEcho(challenge) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            challenge,
        )
            .into_response()),
        CallbackOutcome::DenialHandled => Ok(StatusCode::OK.into_response()),
        CallbackOutcome::ContentAccepted(_) => {
            Err(Error::invalid_input("hub.mode", "content arrives via POST").into())
        }
    }
}

/// `POST /callback/:id`: upstream hub pushing content to us.
async fn callback_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Response> {
    let callback_path = format!("/callback/{id}");
    let content_type = content_type_or_rss(&headers);

    let outcome = state
        .client
        .handle_callback(
            &callback_path,
            None,
            None,
            None,
            None,
            Some((body.to_vec(), content_type)),
        )
        .await?;

    match outcome {
        CallbackOutcome::ContentAccepted(relayed) => {
            Ok(accepted(json!({ "success": true, "relayed": relayed })))
        }
        _ => Ok(StatusCode::OK.into_response()),
    }
}

async fn health(State(state): State<AppState>) -> HttpResult<Response> {
    // A queue read doubles as a store round-trip check
    let pending = state.queue.pending_len().await?;
    Ok(Json(json!({ "status": "ok", "queuePending": pending })).into_response())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn link_self_topic(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(parse_link_header)
        .find(|link| link.rel.eq_ignore_ascii_case("self"))
        .map(|link| link.url)
}

fn is_form_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

fn content_type_or_rss(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| "application/rss+xml".to_string())
}

fn parse_form(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

fn required_field(form: &HashMap<String, String>, name: &str) -> Result<String, HttpError> {
    form.get(name)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| Error::invalid_input(name, "missing").into())
}

fn parse_lease(form: &HashMap<String, String>) -> Result<Option<u32>, HttpError> {
    form.get("hub.lease_seconds")
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            raw.parse::<u32>()
                .map_err(|_| Error::invalid_input("hub.lease_seconds", "not an integer").into())
        })
        .transpose()
}
