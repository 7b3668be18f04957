//! Reverse proxy from `/tool/<session>/...` to the session's tool server.
//!
//! Plain HTTP is forwarded with streamed bodies in both directions. WebSocket
//! upgrades are tunnelled frame by frame to a matching backend connection.

use axum::{
    body::Body,
    extract::ws::{Message, WebSocket},
    http::{HeaderMap, HeaderValue, Request, Response, header},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tracing::{debug, warn};

use super::{ToolError, ToolSupervisor};

const HOP_BY_HOP: &[&str] = &["transfer-encoding", "connection", "keep-alive"];

/// Headers that describe one transport hop and must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Public path prefix for a session's tool, without trailing slash.
pub fn public_prefix(session_id: &str) -> String {
    format!("/tool/{}", session_id)
}

/// Backend URL for `path` (no leading slash needed) and an optional query string.
pub fn upstream_url(port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://127.0.0.1:{}/{}", port, path.trim_start_matches('/'));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Point a redirect at the backend's own origin back under the public prefix.
/// Any other location is returned unchanged.
pub fn rewrite_location(location: &str, port: u16, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    for host in ["127.0.0.1", "localhost"] {
        for scheme in ["http", "https"] {
            let origin = format!("{}://{}:{}", scheme, host, port);
            let Some(rest) = location.strip_prefix(&origin) else {
                continue;
            };
            // Same prefix but a different port, e.g. :87660
            if rest.starts_with(|c: char| c.is_ascii_digit()) {
                continue;
            }
            return if rest.starts_with('/') {
                format!("{}{}", prefix, rest)
            } else {
                format!("{}/{}", prefix, rest)
            };
        }
    }
    location.to_string()
}

pub struct ToolProxy {
    client: reqwest::Client,
    supervisor: Arc<ToolSupervisor>,
}

impl ToolProxy {
    pub fn new(supervisor: Arc<ToolSupervisor>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            // Pass encoded bodies through untouched
            .no_gzip()
            .build()?;
        Ok(Self { client, supervisor })
    }

    pub fn supervisor(&self) -> &Arc<ToolSupervisor> {
        &self.supervisor
    }

    /// Port of the live instance, refreshing its activity.
    pub fn resolve(&self, session_id: &str) -> Result<u16, ToolError> {
        let port = self
            .supervisor
            .port_of(session_id)
            .ok_or_else(|| ToolError::ProxyUnavailable(session_id.to_string()))?;
        self.supervisor.touch(session_id);
        Ok(port)
    }

    /// Forward one HTTP request to the backend and stream its response back.
    pub async fn forward(
        &self,
        session_id: &str,
        sub_path: &str,
        request: Request<Body>,
    ) -> Result<Response<Body>, ToolError> {
        let port = self.resolve(session_id)?;
        let url = upstream_url(port, sub_path, request.uri().query());
        let (parts, body) = request.into_parts();
        debug!("Proxying {} {} -> {}", parts.method, parts.uri, url);

        let mut upstream = self.client.request(parts.method, &url);
        for (name, value) in &parts.headers {
            if name == header::HOST || is_hop_by_hop(name.as_str()) {
                continue;
            }
            upstream = upstream.header(name, value);
        }

        let resp = upstream
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ToolError::ProxyUnavailable(session_id.to_string())
                } else {
                    ToolError::Proxy(e.to_string())
                }
            })?;

        let status = resp.status();
        let headers = response_headers(resp.headers(), port, &public_prefix(session_id));
        let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Bridge an accepted client WebSocket to the backend until either side closes.
    pub async fn tunnel(
        &self,
        mut client: WebSocket,
        session_id: &str,
        sub_path: &str,
        query: Option<&str>,
        cookie: Option<HeaderValue>,
    ) -> Result<(), ToolError> {
        let port = self.resolve(session_id)?;
        let url = upstream_url(port, sub_path, query).replacen("http://", "ws://", 1);

        let mut backend_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ToolError::Proxy(e.to_string()))?;
        if let Some(cookie) = cookie {
            backend_request.headers_mut().insert(header::COOKIE, cookie);
        }

        let backend = match tokio_tungstenite::connect_async(backend_request).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Tool tunnel to {} failed: {}", url, e);
                let _ = client.send(Message::Close(None)).await;
                return Err(ToolError::ProxyUnavailable(session_id.to_string()));
            }
        };
        debug!("Tool tunnel open: {}", url);

        let (mut client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = backend.split();
        let supervisor = &self.supervisor;

        let upstream = async {
            while let Some(Ok(msg)) = client_rx.next().await {
                let out = match msg {
                    Message::Text(text) => tungstenite::Message::Text(text.as_str().into()),
                    Message::Binary(data) => tungstenite::Message::Binary(data),
                    Message::Close(_) => break,
                    _ => continue,
                };
                supervisor.touch(session_id);
                if backend_tx.send(out).await.is_err() {
                    break;
                }
            }
        };

        let downstream = async {
            while let Some(Ok(msg)) = backend_rx.next().await {
                let out = match msg {
                    tungstenite::Message::Text(text) => Message::Text(text.as_str().into()),
                    tungstenite::Message::Binary(data) => Message::Binary(data),
                    tungstenite::Message::Close(_) => break,
                    _ => continue,
                };
                supervisor.touch(session_id);
                if client_tx.send(out).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = upstream => debug!("Tool tunnel for {}: client side ended", session_id),
            _ = downstream => debug!("Tool tunnel for {}: backend side ended", session_id),
        }

        let _ = backend_tx.close().await;
        let _ = client_tx.send(Message::Close(None)).await;
        Ok(())
    }
}

fn response_headers(upstream: &HeaderMap, port: u16, prefix: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if name == header::LOCATION {
            if let Ok(location) = value.to_str() {
                if let Ok(rewritten) =
                    HeaderValue::from_str(&rewrite_location(location, port, prefix))
                {
                    headers.append(name.clone(), rewritten);
                    continue;
                }
            }
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
