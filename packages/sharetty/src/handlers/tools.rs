use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Path, Request, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::Serialize;
use tracing::debug;

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::tools::ToolInstanceInfo;
use crate::tools::proxy::public_prefix;

#[derive(Serialize)]
pub struct StartToolResponse {
    port: u16,
    working_dir: String,
    url: String,
}

/// Start (or reuse) the tool server for a session, in that session's directory.
pub async fn start_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StartToolResponse>> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", id)))?;

    let info = state.tools.start(&id, session.working_dir())?;
    Ok(Json(StartToolResponse {
        port: info.port,
        working_dir: info.working_dir,
        url: format!("{}/", public_prefix(&id)),
    }))
}

pub async fn stop_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let status = if state.tools.stop(&id).await {
        "stopped"
    } else {
        "not_running"
    };
    Json(serde_json::json!({ "status": status }))
}

#[derive(Serialize)]
pub struct ToolStatusResponse {
    running: bool,
    port: Option<u16>,
    idle_seconds: Option<u64>,
}

pub async fn tool_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ToolStatusResponse> {
    let info = state.tools.get(&id);
    Json(ToolStatusResponse {
        running: info.is_some(),
        port: info.as_ref().map(|i| i.port),
        idle_seconds: info.as_ref().map(|i| i.idle_seconds),
    })
}

pub async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolInstanceInfo>> {
    Json(state.tools.list())
}

// =============================================================================
// Proxy surface: /tool/{session_id}/...
// =============================================================================

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// `/tool/{id}` → `/tool/{id}/` so relative asset paths resolve under the prefix.
pub async fn tool_proxy_bare(Path(id): Path<String>) -> Redirect {
    Redirect::permanent(&format!("{}/", public_prefix(&id)))
}

pub async fn tool_proxy_root(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    proxy_request(state, id, String::new(), request).await
}

pub async fn tool_proxy_path(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    proxy_request(state, id, path, request).await
}

async fn proxy_request(
    state: AppState,
    session_id: String,
    decoded_path: String,
    request: Request<Body>,
) -> Response {
    // Forward the path as the client sent it, still percent-encoded
    let prefix = format!("{}/", public_prefix(&session_id));
    let sub_path = request
        .uri()
        .path()
        .strip_prefix(&prefix)
        .map(str::to_string)
        .unwrap_or(decoded_path);

    if is_websocket_upgrade(request.headers()) {
        return tunnel_request(state, session_id, sub_path, request).await;
    }

    state.metrics.request_proxied();
    match state.proxy.forward(&session_id, &sub_path, request).await {
        Ok(response) => response,
        Err(e) => {
            state.metrics.proxy_error();
            ApiError::from(e).into_response()
        }
    }
}

async fn tunnel_request(
    state: AppState,
    session_id: String,
    sub_path: String,
    request: Request<Body>,
) -> Response {
    let query = request.uri().query().map(str::to_string);
    let cookie = request.headers().get(header::COOKIE).cloned();
    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    // Refuse the upgrade outright when there is nothing to tunnel to
    if let Err(e) = state.proxy.resolve(&session_id) {
        state.metrics.proxy_error();
        return ApiError::from(e).into_response();
    }

    let proxy = state.proxy.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| async move {
        metrics.tunnel_opened();
        if let Err(e) = proxy
            .tunnel(socket, &session_id, &sub_path, query.as_deref(), cookie)
            .await
        {
            metrics.proxy_error();
            debug!("Tool tunnel for {} ended with error: {}", session_id, e);
        }
        metrics.tunnel_closed();
    })
}
