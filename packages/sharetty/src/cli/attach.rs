use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::cli::terminal::{TerminalGuard, get_terminal_size};
use crate::relay::ControlFrame;

pub const DETACH_BYTE: u8 = 0x1D; // Ctrl-]

/// What happened when an attach session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// User pressed Ctrl-] to detach; the session keeps running.
    Detached,
    /// The server closed the connection.
    Exited,
    /// The server refused the attach with a message.
    Refused(String),
}

/// Split a stdin read at the detach key: the bytes to forward, and whether to detach.
pub fn split_detach(data: &[u8]) -> (&[u8], bool) {
    match data.iter().position(|&b| b == DETACH_BYTE) {
        Some(pos) => (&data[..pos], true),
        None => (data, false),
    }
}

fn resize_frame(rows: u16, cols: u16) -> Result<tungstenite::Message> {
    let json = serde_json::to_string(&ControlFrame::Resize { rows, cols })?;
    Ok(tungstenite::Message::Text(json.into()))
}

/// Message of a server error frame, if `text` is one.
fn error_message(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "error" {
        return None;
    }
    Some(value.get("message")?.as_str()?.to_string())
}

/// Connect to the relay at `ws_url` and hand the local terminal over to it.
pub async fn attach(ws_url: &str) -> Result<AttachOutcome> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .with_context(|| format!("Failed to connect to {}", ws_url))?;
    attach_session(ws_stream).await
}

async fn attach_session(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Result<AttachOutcome> {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let guard = TerminalGuard::new();
    guard.enter_raw_mode();

    {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(b"\r[sharetty: attached -- press Ctrl-] to detach]\r\n");
        let _ = stdout.flush();
    }

    if let Ok((rows, cols)) = get_terminal_size() {
        ws_write.send(resize_frame(rows, cols)?).await?;
    }

    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    // Blocking stdin reader; polls so it can notice shutdown
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    let stdin_shutdown = Arc::new(AtomicBool::new(false));
    let stdin_shutdown_thread = stdin_shutdown.clone();
    std::thread::spawn(move || {
        use std::io::Read;
        use std::os::fd::AsRawFd;
        let stdin = std::io::stdin();
        let stdin_fd = stdin.as_raw_fd();
        let mut buf = [0u8; 4096];
        loop {
            if stdin_shutdown_thread.load(Ordering::Relaxed) {
                break;
            }
            let mut pfd = nix::libc::pollfd {
                fd: stdin_fd,
                events: nix::libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { nix::libc::poll(&mut pfd, 1, 100) };
            if ret <= 0 {
                continue;
            }
            let mut handle = stdin.lock();
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    drop(handle);
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut outcome = AttachOutcome::Exited;
    loop {
        tokio::select! {
            Some(data) = stdin_rx.recv() => {
                let (forward, detach) = split_detach(&data);
                if !forward.is_empty() {
                    let msg = tungstenite::Message::Binary(forward.to_vec().into());
                    if ws_write.send(msg).await.is_err() {
                        break;
                    }
                }
                if detach {
                    outcome = AttachOutcome::Detached;
                    break;
                }
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        let mut stdout = std::io::stdout().lock();
                        let _ = stdout.write_all(&data);
                        let _ = stdout.flush();
                    }
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Some(message) = error_message(text.as_str()) {
                            outcome = AttachOutcome::Refused(message);
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            _ = sigwinch.recv() => {
                if let Ok((rows, cols)) = get_terminal_size() {
                    let _ = ws_write.send(resize_frame(rows, cols)?).await;
                }
            }
        }
    }

    stdin_shutdown.store(true, Ordering::Relaxed);
    let _ = ws_write.send(tungstenite::Message::Close(None)).await;
    drop(guard);

    match &outcome {
        AttachOutcome::Detached => eprintln!("\r\n[sharetty: detached]"),
        AttachOutcome::Exited => eprintln!("\r\n[sharetty: connection closed]"),
        AttachOutcome::Refused(message) => eprintln!("\r\n[sharetty: {}]", message),
    }
    Ok(outcome)
}
