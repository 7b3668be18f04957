//! Password gate for the HTTP surface.
//!
//! Logging in with the configured password yields an opaque token. The token is
//! accepted from the `sharetty_token` cookie or a `token` query parameter (for
//! WebSocket clients that cannot set cookies). Without a configured password the
//! middleware is never installed.

use axum::{
    body::Body,
    extract::{Query, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::ApiError;

pub const TOKEN_COOKIE: &str = "sharetty_token";

/// Issued session tokens. In memory only; a restart logs everyone out.
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: Mutex<HashSet<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issue(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.lock().insert(token.clone());
        token
    }

    pub fn verify(&self, token: &str) -> bool {
        !token.is_empty() && self.lock().contains(token)
    }

    /// Returns false if the token was not live.
    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(token)
    }
}

// =============================================================================
// Auth State (shared across middleware and handlers)
// =============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub config: Arc<AuthConfig>,
    pub tokens: Arc<TokenStore>,
}

impl AuthState {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config: Arc::new(config),
            tokens: Arc::new(TokenStore::new()),
        }
    }

    pub fn password_matches(&self, candidate: &str) -> bool {
        self.config
            .password
            .as_deref()
            .is_some_and(|password| password == candidate)
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Token presented by the request, cookie first.
pub fn request_token(request: &Request<Body>) -> Option<String> {
    let jar = CookieJar::from_headers(request.headers());
    if let Some(cookie) = jar.get(TOKEN_COOKIE) {
        return Some(cookie.value().to_string());
    }
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.token)
}

pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !auth.config.enabled() || is_public_route(request.uri().path()) {
        return next.run(request).await;
    }

    match request_token(&request) {
        Some(token) if auth.tokens.verify(&token) => next.run(request).await,
        _ => {
            debug!("Rejected unauthenticated request to {}", request.uri().path());
            ApiError::AuthRequired.into_response()
        }
    }
}

fn is_public_route(path: &str) -> bool {
    path == "/health" || path.starts_with("/api/auth/")
}
