//! WebSocket relay between one client connection and a PTY session.
//!
//! Binary frames carry raw terminal bytes in both directions. Text frames from the
//! client are JSON control commands (`resize`, `input`); anything that does not
//! parse as one is typed into the terminal verbatim.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{
    sink::{Sink, SinkExt},
    stream::StreamExt,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pty_session::{Client, ClientId, ClientKind, PtySession, SessionRegistry};

use crate::AppState;
use crate::metrics::ServerMetrics;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

/// Structured commands a client may send as a text frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Resize {
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },
    Input {
        #[serde(default)]
        data: String,
    },
}

/// Server-to-client notice sent before closing a connection it cannot serve
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Error { message: String },
}

/// What an inbound frame asks the session to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Write(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Close,
    Ignore,
}

pub fn decode_frame(msg: Message) -> Inbound {
    match msg {
        Message::Binary(data) if data.is_empty() => Inbound::Ignore,
        Message::Binary(data) => Inbound::Write(data.to_vec()),
        Message::Text(text) => match serde_json::from_str::<ControlFrame>(text.as_str()) {
            Ok(ControlFrame::Resize { rows, cols }) => Inbound::Resize { rows, cols },
            Ok(ControlFrame::Input { data }) if data.is_empty() => Inbound::Ignore,
            Ok(ControlFrame::Input { data }) => Inbound::Write(data.into_bytes()),
            Err(_) if text.as_str().is_empty() => Inbound::Ignore,
            // Not a command: literal keystrokes
            Err(_) => Inbound::Write(text.as_str().as_bytes().to_vec()),
        },
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => Inbound::Ignore,
    }
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    /// Absent means the server's default session
    pub session_id: Option<String>,
    #[serde(default)]
    pub client: ClientKind,
}

/// `GET /ws/terminal?session_id=<id>&client=<terminal|browser>`
pub async fn terminal_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> Response {
    let registry = state.registry.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| {
        handle_terminal(socket, registry, metrics, query.session_id, query.client)
    })
}

/// Deregisters the client exactly once, whichever side ended the connection.
struct Attachment {
    session: Arc<PtySession>,
    client_id: ClientId,
    metrics: Arc<ServerMetrics>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.remove_client(&self.client_id);
        self.metrics.connection_closed();
    }
}

/// Send an error frame, then close.
async fn send_error<S>(sink: &mut S, message: &str)
where
    S: Sink<Message> + Unpin,
{
    let frame = ServerFrame::Error {
        message: message.to_string(),
    };
    match serde_json::to_string(&frame) {
        Ok(json) => {
            let _ = sink.send(Message::Text(json.into())).await;
        }
        Err(e) => warn!("Failed to serialize error frame: {}", e),
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn reject(mut socket: WebSocket, message: &str) {
    send_error(&mut socket, message).await;
}

pub async fn handle_terminal(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ServerMetrics>,
    session_id: Option<String>,
    kind: ClientKind,
) {
    let session = match registry.resolve(session_id.as_deref()) {
        Some(session) if session.is_running() => session,
        Some(session) => {
            debug!("Refusing client for stopped session {}", session.name());
            reject(socket, "Session is not running").await;
            return;
        }
        None => {
            debug!("Refusing client for unknown session {:?}", session_id);
            reject(socket, "No active session").await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let client = Client::new(kind, tx);
    let client_id = client.id.clone();
    let history = session.add_client(client);
    metrics.connection_opened();
    let _attachment = Attachment {
        session: session.clone(),
        client_id: client_id.clone(),
        metrics: metrics.clone(),
    };
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if !history.is_empty() {
        metrics.history_sent(history.len());
        if ws_sender.send(Message::Binary(history.into())).await.is_err() {
            return;
        }
    }

    let sender_task = async {
        while let Some(chunk) = rx.recv().await {
            if ws_sender.send(Message::Binary(chunk.into())).await.is_err() {
                return;
            }
        }
        // The engine dropped our sink: stopped, restarted or deleted
        debug!("Session {} ended under client {}", session.name(), client_id);
        send_error(&mut ws_sender, "Session ended").await;
    };

    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("WebSocket error from client {}: {}", client_id, e);
                    break;
                }
            };
            metrics.frame_received();
            match decode_frame(msg) {
                Inbound::Write(data) => {
                    if !session.write(&data) {
                        debug!("Input for session {} dropped", session.name());
                    }
                }
                Inbound::Resize { rows, cols } => session.resize(rows, cols),
                Inbound::Close => break,
                Inbound::Ignore => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended for client {}", client_id),
        _ = input_task => debug!("Input task ended for client {}", client_id),
    }
}
