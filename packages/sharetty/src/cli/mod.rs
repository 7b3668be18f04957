//! `sharetty attach`: join a running session from the local terminal.

pub mod attach;
pub mod terminal;

use anyhow::{Context, Result};
use serde::Deserialize;

use self::attach::AttachOutcome;

/// Where the attach client connects.
#[derive(Debug, Clone)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Relay URL with the query values percent-encoded.
    pub fn ws_url(&self, session: Option<&str>, token: Option<&str>) -> Result<String> {
        let base = format!("ws://{}:{}/ws/terminal", self.host, self.port);
        let mut url = reqwest::Url::parse(&base)
            .with_context(|| format!("Invalid server address {}:{}", self.host, self.port))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client", "terminal");
            if let Some(session) = session {
                query.append_pair("session_id", session);
            }
            if let Some(token) = token {
                query.append_pair("token", token);
            }
        }
        Ok(url.to_string())
    }
}

#[derive(Deserialize)]
struct AuthStatus {
    auth_required: bool,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

async fn auth_required(server: &ServerAddr) -> Result<bool> {
    let url = format!("{}/api/auth/status", server.base_url());
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach sharetty at {}", server.base_url()))?;
    let status: AuthStatus = resp
        .json()
        .await
        .context("Failed to parse /api/auth/status")?;
    Ok(status.auth_required)
}

async fn login(server: &ServerAddr, password: &str) -> Result<String> {
    let url = format!("{}/api/auth/login", server.base_url());
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&serde_json::json!({ "password": password }))
        .send()
        .await
        .context("Failed to reach login endpoint")?;

    if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
        anyhow::bail!("Authentication failed: invalid password");
    }
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("Authentication failed: {} {}", status, body);
    }
    let body: LoginResponse = resp.json().await.context("Failed to parse login response")?;
    Ok(body.token)
}

/// Authenticate if the server asks for it, then attach.
pub async fn attach_command(
    server: ServerAddr,
    session: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let token = if auth_required(&server).await? {
        let password = match password.filter(|p| !p.is_empty()) {
            Some(password) => password,
            None => tokio::task::spawn_blocking(|| terminal::prompt_password("Password: "))
                .await
                .context("Password prompt failed")??,
        };
        if password.is_empty() {
            anyhow::bail!("Password required but not provided");
        }
        Some(login(&server, &password).await?)
    } else {
        None
    };

    let target = session.as_deref().unwrap_or("default session");
    eprintln!("Connecting to {}@{}:{}...", target, server.host, server.port);

    let ws_url = server.ws_url(session.as_deref(), token.as_deref())?;
    match attach::attach(&ws_url).await? {
        AttachOutcome::Refused(message) => anyhow::bail!("Attach refused: {}", message),
        AttachOutcome::Detached | AttachOutcome::Exited => Ok(()),
    }
}
