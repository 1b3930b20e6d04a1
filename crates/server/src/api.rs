//! Conversation API routes.
//!
//! Caller identity travels in headers: `x-omnichat-tenant` and
//! `x-omnichat-user` name the tenant and operator, `x-omnichat-team-admin`
//! grants team-channel deletion, and `x-omnichat-session` names the viewing
//! session (one per open panel, defaulting to `primary`).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use omnichat_core::domain::channel::{Channel, ChannelId, ChannelType, TenantId, UserId};
use omnichat_core::domain::message::Message;
use omnichat_core::domain::subthread::{ConversationSubThread, ConversationThreadId, SubThreadSummary};
use omnichat_core::domain::template::MessageTemplate;
use omnichat_core::domain::thread::{ThreadId, ThreadSummary};
use omnichat_core::errors::CommsError;
use omnichat_core::session::ViewMode;
use omnichat_core::window::WindowState;
use omnichat_engine::{ConversationEngine, EngineError, OutboundContent, SendRequest};

const SESSION_HEADER: &str = "x-omnichat-session";
const TENANT_HEADER: &str = "x-omnichat-tenant";
const USER_HEADER: &str = "x-omnichat-user";
const TEAM_ADMIN_HEADER: &str = "x-omnichat-team-admin";

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ConversationEngine>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/channels", get(list_channels))
        .route("/api/v1/channels/{channel_id}/threads", get(list_threads))
        .route("/api/v1/channels/{channel_id}/templates", get(list_templates))
        .route("/api/v1/templates/preview", post(preview_template))
        .route("/api/v1/contexts/{context_model}/{context_id}/prefill", get(compose_prefill))
        .route("/api/v1/threads/{thread_id}/messages", get(list_messages))
        .route("/api/v1/threads/{thread_id}/read", post(mark_read))
        .route("/api/v1/threads/{thread_id}/subthreads", get(list_sub_threads).post(start_sub_thread))
        .route("/api/v1/threads/{thread_id}", delete(delete_thread))
        .route("/api/v1/send", post(send))
        .route("/api/v1/session/switch-channel", post(switch_channel))
        .route("/api/v1/session/view", post(set_viewing))
        .route("/api/v1/session/refresh", get(refresh))
        .with_state(state)
}

fn map_engine_error(error: EngineError) -> (StatusCode, Json<ApiError>) {
    let (status, message) = match &error {
        EngineError::Comms(comms) => {
            let status = match comms {
                CommsError::ChannelNotFound(_) | CommsError::ThreadNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                CommsError::WindowClosed { .. } => StatusCode::CONFLICT,
                CommsError::IncompleteVariables { .. }
                | CommsError::TemplateNotApproved { .. }
                | CommsError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                CommsError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                CommsError::ProviderSendFailed(_) => StatusCode::BAD_GATEWAY,
            };
            (status, comms.to_string())
        }
        EngineError::Repository(repository) => {
            error!(event_name = "api_repository_error", error = %repository, "repository failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal storage error".to_string())
        }
        EngineError::ContextLookup(detail) => {
            error!(event_name = "api_context_lookup_error", error = %detail, "record layer lookup failure");
            (StatusCode::BAD_GATEWAY, "record layer lookup failed".to_string())
        }
    };
    (status, Json(ApiError { error: message }))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError { error: message.into() }))
}

fn header_or<'a>(headers: &'a HeaderMap, name: &str, default: &'a str) -> &'a str {
    headers.get(name).and_then(|value| value.to_str().ok()).unwrap_or(default)
}

fn session_key(headers: &HeaderMap) -> String {
    header_or(headers, SESSION_HEADER, "primary").to_string()
}

fn caller(headers: &HeaderMap) -> (TenantId, UserId, bool) {
    let tenant = TenantId(header_or(headers, TENANT_HEADER, "t-1").to_string());
    let user = UserId(header_or(headers, USER_HEADER, "u-anonymous").to_string());
    let is_team_admin = header_or(headers, TEAM_ADMIN_HEADER, "false").eq_ignore_ascii_case("true");
    (tenant, user, is_team_admin)
}

#[derive(Debug, Deserialize)]
struct ChannelListQuery {
    channel_type: Option<String>,
}

async fn list_channels(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ChannelListQuery>,
) -> ApiResult<Vec<Channel>> {
    let (tenant, user, _) = caller(&headers);
    let channel_type = match query.channel_type.as_deref() {
        Some(raw) => Some(
            ChannelType::parse(raw)
                .ok_or_else(|| bad_request(format!("unknown channel type `{raw}`")))?,
        ),
        None => None,
    };

    let channels = state
        .engine
        .list_channels(&tenant, &user, channel_type)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(channels))
}

#[derive(Debug, Deserialize)]
struct ThreadListQuery {
    context_model: Option<String>,
    context_id: Option<i64>,
}

async fn list_threads(
    State(state): State<ApiState>,
    Path(channel_id): Path<String>,
    Query(query): Query<ThreadListQuery>,
) -> ApiResult<Vec<ThreadSummary>> {
    let context = match (&query.context_model, query.context_id) {
        (Some(model), Some(id)) => Some((model.as_str(), id)),
        (None, None) => None,
        _ => {
            return Err(bad_request(
                "context_model and context_id must be provided together",
            ))
        }
    };

    let threads = state
        .engine
        .list_threads(&ChannelId(channel_id), context)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(threads))
}

async fn list_messages(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> ApiResult<Vec<Message>> {
    let messages = state
        .engine
        .list_messages(&session_key(&headers), &ThreadId(thread_id))
        .await
        .map_err(map_engine_error)?;
    Ok(Json(messages))
}

async fn mark_read(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.engine.mark_read(&ThreadId(thread_id)).await.map_err(map_engine_error)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct SendBody {
    channel_id: String,
    to: String,
    body: Option<String>,
    subject: Option<String>,
    template_name: Option<String>,
    #[serde(default)]
    variables: Vec<String>,
    context_model: Option<String>,
    context_id: Option<i64>,
}

async fn send(
    State(state): State<ApiState>,
    Json(body): Json<SendBody>,
) -> ApiResult<Message> {
    let content = match (&body.template_name, &body.body) {
        (Some(name), _) => OutboundContent::Template {
            name: name.clone(),
            variables: body.variables.clone(),
        },
        (None, Some(text)) => {
            OutboundContent::FreeForm { body: text.clone(), subject: body.subject.clone() }
        }
        (None, None) => return Err(bad_request("either body or template_name is required")),
    };

    let context = match (&body.context_model, body.context_id) {
        (Some(model), Some(id)) => Some((model.clone(), id)),
        (None, None) => None,
        _ => {
            return Err(bad_request(
                "context_model and context_id must be provided together",
            ))
        }
    };

    let message = state
        .engine
        .send(SendRequest {
            channel_id: ChannelId(body.channel_id),
            to: body.to,
            content,
            context,
        })
        .await
        .map_err(map_engine_error)?;
    Ok(Json(message))
}

async fn list_templates(
    State(state): State<ApiState>,
    Path(channel_id): Path<String>,
) -> ApiResult<Vec<MessageTemplate>> {
    let templates = state
        .engine
        .list_templates(&ChannelId(channel_id))
        .await
        .map_err(map_engine_error)?;
    Ok(Json(templates))
}

#[derive(Debug, Deserialize)]
struct PreviewBody {
    channel_id: String,
    name: String,
    #[serde(default)]
    variables: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    rendered: String,
}

async fn preview_template(
    State(state): State<ApiState>,
    Json(body): Json<PreviewBody>,
) -> ApiResult<PreviewResponse> {
    let rendered = state
        .engine
        .preview_template(&ChannelId(body.channel_id), &body.name, &body.variables)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(PreviewResponse { rendered }))
}

async fn compose_prefill(
    State(state): State<ApiState>,
    Path((context_model, context_id)): Path<(String, i64)>,
) -> ApiResult<omnichat_providers::ComposePrefill> {
    let prefill = state
        .engine
        .compose_prefill(&context_model, context_id)
        .await
        .map_err(map_engine_error)?;

    match prefill {
        Some(prefill) => Ok(Json(prefill)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError { error: "no compose prefill for this context".to_string() }),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct StartSubThreadBody {
    label: String,
}

async fn start_sub_thread(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
    Json(body): Json<StartSubThreadBody>,
) -> ApiResult<ConversationSubThread> {
    let (_, user, _) = caller(&headers);
    let sub_thread = state
        .engine
        .start_sub_thread(&ThreadId(thread_id), &body.label, &user)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(sub_thread))
}

async fn list_sub_threads(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Vec<SubThreadSummary>> {
    let summaries = state
        .engine
        .list_sub_threads(&ThreadId(thread_id))
        .await
        .map_err(map_engine_error)?;
    Ok(Json(summaries))
}

async fn delete_thread(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(thread_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let (_, user, is_team_admin) = caller(&headers);
    state
        .engine
        .delete_thread(&ThreadId(thread_id), &user, is_team_admin)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct SwitchChannelBody {
    channel_id: String,
}

#[derive(Debug, Serialize)]
struct SwitchChannelResponse {
    active_thread_id: Option<ThreadId>,
}

async fn switch_channel(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<SwitchChannelBody>,
) -> ApiResult<SwitchChannelResponse> {
    let active_thread_id = state
        .engine
        .switch_channel(&session_key(&headers), &ChannelId(body.channel_id))
        .await
        .map_err(map_engine_error)?;
    Ok(Json(SwitchChannelResponse { active_thread_id }))
}

#[derive(Debug, Deserialize)]
struct ViewBody {
    thread_id: String,
    conversation_thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ViewResponse {
    view_mode: ViewMode,
}

async fn set_viewing(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ViewBody>,
) -> ApiResult<ViewResponse> {
    let view_mode = state
        .engine
        .set_viewing_thread(
            &session_key(&headers),
            &ThreadId(body.thread_id),
            body.conversation_thread_id.map(ConversationThreadId),
        )
        .await
        .map_err(map_engine_error)?;
    Ok(Json(ViewResponse { view_mode }))
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    thread_id: Option<ThreadId>,
    new_messages: Vec<Message>,
    window_state: Option<WindowState>,
    window_expires_at: Option<DateTime<Utc>>,
}

async fn refresh(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<RefreshResponse> {
    let changes = state
        .engine
        .refresh(&session_key(&headers))
        .await
        .map_err(map_engine_error)?;
    Ok(Json(RefreshResponse {
        thread_id: changes.thread_id,
        new_messages: changes.new_messages,
        window_state: changes.window_state,
        window_expires_at: changes.window_expires_at,
    }))
}
