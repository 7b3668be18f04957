use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pty_session::PtyError;

use crate::tools::ToolError;

/// Failures surfaced by the HTTP API, rendered as `{"error": kind, "message": text}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] PtyError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required")]
    AuthRequired,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Session(PtyError::Launch(_)) => "launch_error",
            ApiError::Session(_) => "session_error",
            ApiError::Tool(ToolError::ResourceExhausted { .. }) => "resource_exhausted",
            ApiError::Tool(ToolError::BinaryNotFound(_)) => "binary_not_found",
            ApiError::Tool(ToolError::Launch(_)) => "launch_error",
            ApiError::Tool(ToolError::ProxyUnavailable(_)) => "proxy_unavailable",
            ApiError::Tool(ToolError::Proxy(_)) => "proxy_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::AuthRequired => "auth_required",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Tool(ToolError::ResourceExhausted { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Tool(ToolError::BinaryNotFound(_)) => StatusCode::FAILED_DEPENDENCY,
            ApiError::Tool(ToolError::Launch(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Tool(ToolError::ProxyUnavailable(_) | ToolError::Proxy(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("{} ({}): {}", status, self.kind(), self);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_launch_error_is_500() {
        let (status, json) = body_json(PtyError::Launch("no such file".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "launch_error");
        assert!(json["message"].as_str().unwrap().contains("no such file"));
    }

    #[tokio::test]
    async fn test_tool_errors_map_to_statuses() {
        let cases = [
            (
                ToolError::ResourceExhausted { max: 10 },
                StatusCode::SERVICE_UNAVAILABLE,
                "resource_exhausted",
            ),
            (
                ToolError::BinaryNotFound("code-server".into()),
                StatusCode::FAILED_DEPENDENCY,
                "binary_not_found",
            ),
            (
                ToolError::ProxyUnavailable("s1".into()),
                StatusCode::BAD_GATEWAY,
                "proxy_unavailable",
            ),
            (
                ToolError::Proxy("reset".into()),
                StatusCode::BAD_GATEWAY,
                "proxy_error",
            ),
        ];
        for (err, status, kind) in cases {
            let (got_status, json) = body_json(err.into()).await;
            assert_eq!(got_status, status);
            assert_eq!(json["error"], kind);
        }
    }

    #[tokio::test]
    async fn test_auth_required_is_401() {
        let (status, json) = body_json(ApiError::AuthRequired).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "auth_required");
    }
}
