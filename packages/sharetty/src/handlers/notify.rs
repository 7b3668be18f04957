use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyTopic {
    /// `None` or empty disables notifications
    #[serde(default)]
    pub topic: Option<String>,
}

pub async fn get_notify_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NotifyTopic>> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", id)))?;
    Ok(Json(NotifyTopic {
        topic: session.notify_topic(),
    }))
}

pub async fn set_notify_topic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<NotifyTopic>,
) -> ApiResult<Json<NotifyTopic>> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {}", id)))?;
    session.set_notify_topic(req.topic.map(|t| t.trim().to_string()));
    Ok(Json(NotifyTopic {
        topic: session.notify_topic(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, http::StatusCode, routing::get};
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new()
            .route(
                "/api/sessions/{id}/notify",
                get(get_notify_topic).put(set_notify_topic),
            )
            .with_state(state)
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn put(topic: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri("/api/sessions/s1/notify")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "topic": topic }).to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get_topic() {
        let (state, _launcher, _tmp) = crate::test_helpers::test_app_state();
        let session = state
            .registry
            .get_or_create("s1", "/tmp", &["agent".to_string()])
            .unwrap();
        let router = app(state);

        let (status, json) = send(&router, get_req("/api/sessions/s1/notify")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["topic"].is_null());

        let (_, json) = send(&router, put(serde_json::json!(" alerts-123 "))).await;
        assert_eq!(json["topic"], "alerts-123");
        assert_eq!(session.notify_topic().as_deref(), Some("alerts-123"));

        // Empty disables
        let (_, json) = send(&router, put(serde_json::json!(""))).await;
        assert!(json["topic"].is_null());
        assert_eq!(session.notify_topic(), None);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (state, _launcher, _tmp) = crate::test_helpers::test_app_state();
        let router = app(state);

        let (status, json) = send(&router, get_req("/api/sessions/nope/notify")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }
}
