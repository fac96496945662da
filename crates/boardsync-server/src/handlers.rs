use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use boardsync_core::{BoardId, ConnectionId, Frame};

use crate::control::{
    Ack, AdminAction, AdminSnapshot, ConnectRequest, ConnectedPayload, ControlAction, ControlRequest,
    KickResult, StreamQuery, CONNECT_INTENT, DEFAULT_KICK_REDIRECT,
};
use crate::error::ApiError;
use crate::server::AppState;
use crate::session::{self, SessionIdentity};
use crate::sink::{ChannelSink, EventSink};
use crate::stream::ConnectionStream;

/// `GET /api/sse?boardId=`
pub async fn stream_get(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    open_stream(&state, &headers, query.board_id).await
}

/// `POST /api/sse`: either opens a stream (`{"type":"sse_connect"}`) or
/// carries a control action.
pub async fn stream_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let value: Value = serde_json::from_slice(&body).map_err(|_| invalid_request())?;
    if value.get("type").and_then(Value::as_str) == Some(CONNECT_INTENT) {
        let req: ConnectRequest = serde_json::from_value(value).map_err(|_| invalid_request())?;
        return open_stream(&state, &headers, req.board_id).await;
    }
    control(&state, &headers, value).await.map(IntoResponse::into_response)
}

async fn open_stream(
    state: &AppState,
    headers: &HeaderMap,
    board_id: Option<BoardId>,
) -> Result<Response, ApiError> {
    let user_id = session::resolve(state.sessions.as_ref(), headers)
        .await
        .map(|identity| identity.user_id);
    let id = ConnectionId::new();
    let (sink, rx) = ChannelSink::new(state.config.send_queue_depth);

    // Queued before admission so nothing a broadcast sends can overtake it.
    let connected = ConnectedPayload {
        client_id: id.clone(),
        timestamp: Utc::now().timestamp_millis(),
    };
    let data = serde_json::to_string(&connected).map_err(|e| ApiError::Internal(e.to_string()))?;
    let frame = Frame::new(data).event("connected").retry(state.config.retry_hint_ms);
    if let Err(e) = sink.write(&frame.to_bytes()) {
        warn!(connection_id = %id, error = %e, "failed to queue connected frame");
    }

    state
        .registry
        .admit(id.clone(), Arc::new(sink), user_id.clone(), board_id.clone())
        .map_err(|_| ApiError::ConnectionLimit {
            retry_after_secs: state.config.retry_hint_ms.div_ceil(1000),
        })?;
    let stream = ConnectionStream::new(id, rx, state.notifier.clone());

    if let (Some(board_id), Some(user_id)) = (&board_id, &user_id) {
        state.notifier.user_joined(board_id, user_id).await;
    }

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn control(state: &AppState, headers: &HeaderMap, value: Value) -> Result<Json<Ack>, ApiError> {
    let req: ControlRequest = serde_json::from_value(value).map_err(|_| invalid_request())?;
    let identity = authenticate(state, headers).await?;

    let conn = state
        .registry
        .info(&req.client_id)
        .ok_or_else(|| ApiError::NotFound("Client not found".into()))?;
    if conn.user_id.as_ref().is_some_and(|u| *u != identity.user_id) {
        return Err(ApiError::Forbidden("Client belongs to another user".into()));
    }
    let action: ControlAction = req
        .action
        .parse()
        .map_err(|_| ApiError::BadRequest("Unknown action".into()))?;
    let user_id = identity.user_id;

    match action {
        ControlAction::JoinBoard => {
            let Some(board_id) = req.board_id else {
                return Ok(Json(Ack::ok()));
            };
            let joined = state
                .registry
                .join(&req.client_id, board_id.clone(), Some(user_id.clone()))
                .map_err(|_| ApiError::ConnectionLimit {
                    retry_after_secs: state.config.retry_hint_ms.div_ceil(1000),
                })?;
            if joined {
                if let Some(previous) = conn.board_id.filter(|b| *b != board_id) {
                    if state.registry.is_last_user_connection(&previous, &user_id, &req.client_id) {
                        state.notifier.user_left(&previous, &user_id).await;
                    }
                }
                state.notifier.user_joined(&board_id, &user_id).await;
            }
        }
        ControlAction::LeaveBoard => {
            if let Some(board_id) = state.registry.leave(&req.client_id) {
                if state.registry.is_last_user_connection(&board_id, &user_id, &req.client_id) {
                    state.notifier.user_left(&board_id, &user_id).await;
                }
            }
        }
        ControlAction::PresenceUpdate => {
            if let Some(board_id) = &conn.board_id {
                let activity = req.data.unwrap_or(Value::Null);
                state.notifier.presence_update(board_id, &user_id, activity).await;
            }
        }
    }
    Ok(Json(Ack::ok()))
}

/// `GET /api/admin/connections`
pub async fn admin_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AdminSnapshot>, ApiError> {
    require_admin(&state, &headers).await?;
    Ok(Json(AdminSnapshot::from_connections(state.registry.snapshot())))
}

/// `POST /api/admin/connections`: kick a user or a single client.
pub async fn admin_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<KickResult>, ApiError> {
    let admin = require_admin(&state, &headers).await?;
    let action: AdminAction = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Invalid action".into()))?;

    let removed = match action {
        AdminAction::KickUser { user_id, redirect_to } => state
            .registry
            .kick_user(&user_id, redirect_to.as_deref().unwrap_or(DEFAULT_KICK_REDIRECT)),
        AdminAction::KickClient {
            client_id,
            redirect_to,
        } => state
            .registry
            .kick_client(&client_id, redirect_to.as_deref().unwrap_or(DEFAULT_KICK_REDIRECT))
            .into_iter()
            .collect(),
    };
    let kicked = removed.len();
    state.notifier.connections_closed(removed).await;

    info!(admin = %admin.user_id, kicked, "admin kick");
    Ok(Json(KickResult { success: true, kicked }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "connections": state.registry.connection_count(),
        "boards": state.registry.board_count(),
    }))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<SessionIdentity, ApiError> {
    let token = session::session_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))?;
    state
        .sessions
        .lookup(token)
        .await
        .ok_or_else(|| ApiError::Unauthorized("Invalid session".into()))
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<SessionIdentity, ApiError> {
    let identity = authenticate(state, headers).await?;
    if !identity.is_admin {
        return Err(ApiError::Forbidden("Admin access required".into()));
    }
    Ok(identity)
}

fn invalid_request() -> ApiError {
    ApiError::BadRequest("Invalid request".into())
}
