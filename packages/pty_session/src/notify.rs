//! Idle-output notifications.
//!
//! When a session goes quiet after printing something that looks like a prompt, a
//! short message is pushed to the session's notification topic. Classification is a
//! best-effort heuristic: an ordered table of patterns, first match wins.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Message used when the quiet output matches none of the prompt patterns.
pub const GENERIC_MESSAGE: &str = "Has an update";

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Quiet period after the last chunk before a notification fires
    pub debounce: Duration,
    /// Minimum spacing between two delivered notifications
    pub cooldown: Duration,
    /// Size of the rolling text buffer; older bytes are dropped
    pub buffer_bytes: usize,
    /// Stripped text shorter than this never notifies
    pub min_text_len: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            cooldown: Duration::from_secs(3),
            buffer_bytes: 2048,
            min_text_len: 5,
        }
    }
}

/// Delivers a notification to an external service.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, topic: &str, title: &str, message: &str) -> anyhow::Result<()>;
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, topic: &str, _title: &str, _message: &str) -> anyhow::Result<()> {
        debug!("No notifier configured, dropping notification for topic {}", topic);
        Ok(())
    }
}

static CSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("CSI pattern is valid")
});
static OSC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").expect("OSC pattern is valid")
});
static CONTROL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f]").expect("control pattern is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

static PROMPTS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\?\s*$", "Asking a question"),
        (r"\[y/n\]", "Needs confirmation"),
        (r"\(y/n\)", "Needs confirmation"),
        (r"proceed\?", "Asking to proceed"),
        (r"continue\?", "Asking to continue"),
        (r"select.*:", "Waiting for a selection"),
        (r"choose.*:", "Waiting for a choice"),
        (r"enter.*:", "Waiting for input"),
    ]
    .into_iter()
    .map(|(pattern, label)| {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("prompt pattern is valid");
        (regex, label)
    })
    .collect()
});

/// Decode terminal output and reduce it to plain, single-spaced text.
pub fn strip_control(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = OSC.replace_all(&text, "");
    let text = CSI.replace_all(&text, "");
    let text = CONTROL.replace_all(&text, " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Label of the first prompt pattern matching `text`.
pub fn classify(text: &str) -> Option<&'static str> {
    PROMPTS
        .iter()
        .find(|(regex, _)| regex.is_match(text))
        .map(|(_, label)| *label)
}

pub fn message_for(text: &str) -> &'static str {
    classify(text).unwrap_or(GENERIC_MESSAGE)
}

/// Shared, live-updatable notification topic of one session.
pub(crate) type TopicSlot = Arc<RwLock<Option<String>>>;

pub(crate) fn current_topic(slot: &TopicSlot) -> Option<String> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Rolling text buffer plus cooldown anchor.
struct IdleBuffer {
    config: NotifyConfig,
    pending: Vec<u8>,
    last_fired: Option<Instant>,
}

impl IdleBuffer {
    fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
            last_fired: None,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() > self.config.buffer_bytes {
            let excess = self.pending.len() - self.config.buffer_bytes;
            self.pending.drain(..excess);
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    /// Consume the buffer; returns the message to deliver, if any.
    fn fire(&mut self, now: Instant) -> Option<&'static str> {
        let pending = std::mem::take(&mut self.pending);

        if let Some(last) = self.last_fired {
            if now.duration_since(last) < self.config.cooldown {
                debug!("Notification suppressed by cooldown");
                return None;
            }
        }

        let text = strip_control(&pending);
        if text.chars().count() < self.config.min_text_len {
            return None;
        }

        self.last_fired = Some(now);
        Some(message_for(&text))
    }
}

/// Spawn the debounce task for one session; output chunks are fed through the
/// returned sender. The task ends when the sender is dropped.
pub(crate) fn spawn_debouncer(
    runtime: &Handle,
    session_name: String,
    topic: TopicSlot,
    notifier: Arc<dyn Notifier>,
    config: NotifyConfig,
) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime.spawn(run_debouncer(rx, session_name, topic, notifier, config));
    tx
}

async fn run_debouncer(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    session_name: String,
    topic: TopicSlot,
    notifier: Arc<dyn Notifier>,
    config: NotifyConfig,
) {
    let debounce = config.debounce;
    let mut buffer = IdleBuffer::new(config);

    let timer = tokio::time::sleep(debounce);
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        tokio::select! {
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                if current_topic(&topic).is_none() {
                    buffer.clear();
                    continue;
                }
                buffer.push(&chunk);
                timer.as_mut().reset(Instant::now() + debounce);
                armed = true;
            }
            () = &mut timer, if armed => {
                armed = false;
                let Some(topic) = current_topic(&topic) else {
                    buffer.clear();
                    continue;
                };
                let Some(message) = buffer.fire(Instant::now()) else {
                    continue;
                };

                let notifier = notifier.clone();
                let title = session_name.clone();
                tokio::spawn(async move {
                    match notifier.notify(&topic, &title, message).await {
                        Ok(()) => info!("Notification sent for {}: {}", title, message),
                        Err(e) => warn!("Notification delivery for {} failed: {:#}", title, e),
                    }
                });
            }
        }
    }

    debug!("Notification debouncer for {} stopped", session_name);
}
