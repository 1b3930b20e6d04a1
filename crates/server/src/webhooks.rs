//! Provider-facing webhook routes. These carry no user session; an optional
//! shared secret header guards the POST routes, and the WhatsApp GET route
//! implements the Cloud API verification handshake.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use omnichat_engine::{ConversationEngine, EngineError};
use omnichat_providers::inbound::{EmailInboundPayload, WhatsAppWebhookPayload};

const WEBHOOK_SECRET_HEADER: &str = "x-omnichat-webhook-secret";

#[derive(Clone)]
pub struct WebhookState {
    pub engine: Arc<ConversationEngine>,
    pub webhook_secret: Option<String>,
    pub verify_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookError {
    error: String,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/whatsapp", get(verify_whatsapp).post(ingest_whatsapp))
        .route("/webhooks/email", post(ingest_email))
        .with_state(state)
}

fn guard(
    state: &WebhookState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<WebhookError>)> {
    let Some(expected) = &state.webhook_secret else {
        return Ok(());
    };
    let presented =
        headers.get(WEBHOOK_SECRET_HEADER).and_then(|value| value.to_str().ok());
    if presented == Some(expected.as_str()) {
        return Ok(());
    }
    warn!(event_name = "webhook_secret_rejected", "webhook request failed the secret check");
    Err((
        StatusCode::UNAUTHORIZED,
        Json(WebhookError { error: "invalid webhook secret".to_string() }),
    ))
}

/// Cloud API verification handshake: echo `hub.challenge` when the presented
/// verify token matches.
async fn verify_whatsapp(
    State(state): State<WebhookState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, (StatusCode, Json<WebhookError>)> {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge");

    match (mode, token, challenge, &state.verify_token) {
        (Some("subscribe"), Some(token), Some(challenge), Some(expected))
            if token == expected =>
        {
            Ok(challenge.clone())
        }
        _ => Err((
            StatusCode::FORBIDDEN,
            Json(WebhookError { error: "verification failed".to_string() }),
        )),
    }
}

async fn ingest_whatsapp(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(payload): Json<WhatsAppWebhookPayload>,
) -> Result<Json<Value>, (StatusCode, Json<WebhookError>)> {
    guard(&state, &headers)?;

    let outcome = state
        .engine
        .handle_whatsapp_webhook(&payload)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "messages_ingested": outcome.messages_ingested,
        "statuses_applied": outcome.statuses_applied,
    })))
}

async fn ingest_email(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(payload): Json<EmailInboundPayload>,
) -> Result<Json<Value>, (StatusCode, Json<WebhookError>)> {
    guard(&state, &headers)?;

    let thread_id = state
        .engine
        .handle_email_inbound(&payload)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({ "thread_id": thread_id.map(|id| id.0) })))
}

fn internal_error(error: EngineError) -> (StatusCode, Json<WebhookError>) {
    warn!(event_name = "webhook_ingest_failed", error = %error, "webhook ingestion failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(WebhookError { error: "ingestion failed".to_string() }),
    )
}
