use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use pty_session::SessionSummary;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

const MAX_ID_LEN: usize = 64;

/// Session ids appear in URLs and tool paths: `[A-Za-z0-9._-]{1,64}`.
pub fn validate_session_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(ApiError::BadRequest(format!(
            "session id must be 1-{} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ApiError::BadRequest(format!(
            "session id {:?} may only contain letters, digits, '.', '_' and '-'",
            id
        )));
    }
    Ok(())
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list())
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    id: String,
    working_dir: Option<String>,
    #[serde(default)]
    extra_args: Vec<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionSummary>)> {
    validate_session_id(&req.id)?;

    if let Some(existing) = state.registry.get(&req.id) {
        return Ok((StatusCode::OK, Json(SessionSummary::from(existing.as_ref()))));
    }

    let working_dir = req
        .working_dir
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| state.defaults.working_dir.clone());
    let command = state.defaults.command_with(&req.extra_args);

    let session = state
        .registry
        .get_or_create(&req.id, &working_dir, &command)
        .inspect_err(|_| state.metrics.launch_error())?;
    state.metrics.session_created();

    Ok((
        StatusCode::CREATED,
        Json(SessionSummary::from(session.as_ref())),
    ))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.registry.delete(&id) {
        return Err(ApiError::NotFound(format!("session not found: {}", id)));
    }
    state.metrics.session_stopped();
    // The session's tool server goes with it
    state.tools.stop(&id).await;

    Ok(Json(serde_json::json!({ "status": "deleted", "id": id })))
}

#[derive(Deserialize, Default)]
pub struct RestartSessionRequest {
    /// Absent means the default session
    id: Option<String>,
}

#[derive(Serialize)]
pub struct RestartSessionResponse {
    status: &'static str,
    session: SessionSummary,
}

/// `POST /api/sessions/restart`; an empty body restarts the default session.
pub async fn restart_session(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<RestartSessionResponse>> {
    let req: RestartSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RestartSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid restart request: {}", e)))?
    };

    let id = match req.id {
        Some(id) => {
            validate_session_id(&id)?;
            id
        }
        None => state
            .registry
            .default_name()
            .unwrap_or_else(|| state.defaults.name.clone()),
    };

    let session = state
        .registry
        .restart(&id, &state.defaults.working_dir, &state.defaults.command)
        .inspect_err(|_| state.metrics.launch_error())?;
    state.metrics.session_created();

    Ok(Json(RestartSessionResponse {
        status: "restarted",
        session: SessionSummary::from(session.as_ref()),
    }))
}

#[derive(Serialize)]
pub struct StatusResponse {
    working_dir: String,
    default_session: Option<String>,
    session_running: bool,
    connected_clients: usize,
    sessions: Vec<SessionSummary>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let default = state.registry.get_default();
    Json(StatusResponse {
        working_dir: state.defaults.working_dir.clone(),
        default_session: default.as_ref().map(|s| s.name().to_string()),
        session_running: default.as_ref().is_some_and(|s| s.is_running()),
        connected_clients: default.as_ref().map_or(0, |s| s.client_count()),
        sessions: state.registry.list(),
    })
}

/// How to attach a terminal to this server.
pub async fn get_attach_command(State(state): State<AppState>) -> Json<serde_json::Value> {
    let host = match state.server_config.host.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1",
        host => host,
    };
    Json(serde_json::json!({
        "command": format!("sharetty attach --host {} --port {}", host, state.server_config.port),
        "description": "Run this command in another terminal to attach to the same session",
    }))
}
