use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use crate::auth::TOKEN_COOKIE;
use crate::error::ApiError;

pub async fn auth_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "auth_required": state.auth.config.enabled() }))
}

#[derive(Deserialize)]
pub struct LoginRequest {
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Response {
    if !state.auth.config.enabled() {
        return ApiError::BadRequest("authentication is not enabled".into()).into_response();
    }
    if !state.auth.password_matches(&req.password) {
        info!("Rejected login attempt");
        return ApiError::AuthRequired.into_response();
    }

    let token = state.auth.tokens.issue();
    let cookie = Cookie::build((TOKEN_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    (
        jar.add(cookie),
        Json(serde_json::json!({ "token": token })),
    )
        .into_response()
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    if let Some(cookie) = jar.get(TOKEN_COOKIE) {
        state.auth.tokens.revoke(cookie.value());
    }
    (
        StatusCode::OK,
        jar.remove(Cookie::build(TOKEN_COOKIE).path("/")),
        Json(serde_json::json!({ "status": "logged_out" })),
    )
}
