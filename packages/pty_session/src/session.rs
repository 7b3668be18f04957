use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PtyError;
use crate::launcher::{LaunchSpec, PtyControl, PtyLauncher, PtyOutput, ReadOutcome};
use crate::lock;
use crate::notify::{self, Notifier, NotifyConfig, TopicSlot};
use crate::replay::{DEFAULT_REPLAY_CAP, ReplayBuffer};

/// Tunables shared by every engine a registry starts
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub replay_cap: usize,
    pub read_chunk: usize,
    pub poll_interval: Duration,
    pub rows: u16,
    pub cols: u16,
    pub notify: NotifyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replay_cap: DEFAULT_REPLAY_CAP,
            read_chunk: 4096,
            poll_interval: Duration::from_millis(100),
            rows: 24,
            cols: 80,
            notify: NotifyConfig::default(),
        }
    }
}

/// Short random identifier of one client connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn random() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Terminal,
    #[default]
    Browser,
}

/// A connected viewer. The engine pushes every output chunk into `sink`.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub kind: ClientKind,
    pub sink: mpsc::UnboundedSender<Vec<u8>>,
    pub connected_at: DateTime<Utc>,
}

impl Client {
    pub fn new(kind: ClientKind, sink: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id: ClientId::random(),
            kind,
            sink,
            connected_at: Utc::now(),
        }
    }
}

/// History and viewers live under one lock so that registering a client and
/// broadcasting a chunk are mutually atomic.
struct Fanout {
    replay: ReplayBuffer,
    clients: HashMap<ClientId, Client>,
    /// Set once the engine has stopped; no client is kept after that
    closed: bool,
}

impl Fanout {
    /// Drop every client sink so receivers see the end of the stream.
    fn close(&mut self) -> usize {
        self.closed = true;
        let count = self.clients.len();
        self.clients.clear();
        count
    }

    fn broadcast(&mut self, chunk: &[u8]) {
        self.replay.push(chunk.to_vec());
        for client in self.clients.values() {
            if client.sink.send(chunk.to_vec()).is_err() {
                debug!("Client {} sink is closed, skipping chunk", client.id);
            }
        }
    }
}

/// One child process on a pseudo-terminal, shared by any number of clients.
pub struct PtySession {
    name: String,
    working_dir: String,
    command: Vec<String>,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    running: Arc<AtomicBool>,
    fanout: Arc<Mutex<Fanout>>,
    control: Mutex<Option<Box<dyn PtyControl>>>,
    notify_topic: TopicSlot,
}

impl PtySession {
    /// Launch `command` in `working_dir` and start the background reader.
    ///
    /// When called inside a tokio runtime, an idle-output debouncer is started as
    /// well; outside of one, notifications are unavailable for this session.
    pub fn start(
        name: &str,
        working_dir: &str,
        command: &[String],
        launcher: &dyn PtyLauncher,
        notifier: Arc<dyn Notifier>,
        config: &EngineConfig,
    ) -> Result<Arc<Self>, PtyError> {
        let spec = LaunchSpec {
            command: command.to_vec(),
            working_dir: working_dir.to_string(),
            env: vec![("SHARETTY_SESSION".to_string(), name.to_string())],
            rows: config.rows,
            cols: config.cols,
        };
        let launched = launcher.launch(&spec)?;
        let pid = launched.control.pid();

        let session = Arc::new(Self {
            name: name.to_string(),
            working_dir: working_dir.to_string(),
            command: command.to_vec(),
            created_at: Utc::now(),
            pid,
            running: Arc::new(AtomicBool::new(true)),
            fanout: Arc::new(Mutex::new(Fanout {
                replay: ReplayBuffer::new(config.replay_cap),
                clients: HashMap::new(),
                closed: false,
            })),
            control: Mutex::new(Some(launched.control)),
            notify_topic: Arc::new(RwLock::new(None)),
        });

        let notify_tx = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(notify::spawn_debouncer(
                &runtime,
                name.to_string(),
                session.notify_topic.clone(),
                notifier,
                config.notify.clone(),
            )),
            Err(_) => {
                warn!("No async runtime for session {}, notifications disabled", name);
                None
            }
        };

        let reader = Reader {
            name: name.to_string(),
            output: launched.output,
            running: session.running.clone(),
            fanout: session.fanout.clone(),
            topic: session.notify_topic.clone(),
            notify_tx,
            chunk: config.read_chunk.max(1),
            poll_interval: config.poll_interval,
        };
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", name))
            .spawn(move || reader.run())
            .map_err(|e| {
                session.running.store(false, Ordering::SeqCst);
                PtyError::Launch(format!("failed to start reader thread: {}", e))
            })?;

        info!(
            "Session {} started in {} (pid {:?}): {:?}",
            name, working_dir, pid, command
        );
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Forward raw input to the child. Never fails loudly: `false` means the bytes
    /// were not delivered.
    pub fn write(&self, data: &[u8]) -> bool {
        if !self.is_running() {
            return false;
        }
        let mut control = lock(&self.control);
        let Some(control) = control.as_mut() else {
            return false;
        };
        match control.write(data) {
            Ok(()) => true,
            Err(e) => {
                warn!("Write to session {} failed: {}", self.name, e);
                false
            }
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        let control = lock(&self.control);
        if let Some(control) = control.as_ref() {
            if let Err(e) = control.resize(rows, cols) {
                debug!("Resize of session {} ignored: {}", self.name, e);
            }
        }
    }

    /// Register a client and return the history it has to replay first.
    ///
    /// On a stopped engine the client is not kept: its sink is dropped right away,
    /// so the receiver ends after the history.
    pub fn add_client(&self, client: Client) -> Vec<u8> {
        let mut fanout = lock(&self.fanout);
        let history = fanout.replay.snapshot();
        if fanout.closed {
            debug!(
                "Session {} has ended, not registering client {}",
                self.name, client.id
            );
            return history;
        }
        info!(
            "Client {} ({:?}) attached to session {}",
            client.id, client.kind, self.name
        );
        fanout.clients.insert(client.id.clone(), client);
        history
    }

    pub fn remove_client(&self, id: &ClientId) -> bool {
        let removed = lock(&self.fanout).clients.remove(id).is_some();
        if removed {
            info!("Client {} detached from session {}", id, self.name);
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        lock(&self.fanout).clients.len()
    }

    pub fn replay_snapshot(&self) -> Vec<u8> {
        lock(&self.fanout).replay.snapshot()
    }

    /// Set or clear the notification topic; an empty topic disables notifications.
    pub fn set_notify_topic(&self, topic: Option<String>) {
        let topic = topic.filter(|t| !t.is_empty());
        info!("Notification topic for {} set to {:?}", self.name, topic);
        *self
            .notify_topic
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = topic;
    }

    pub fn notify_topic(&self) -> Option<String> {
        notify::current_topic(&self.notify_topic)
    }

    /// Terminate the child, release the terminal and disconnect every client.
    /// Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let control = lock(&self.control).take();
        if let Some(mut control) = control {
            if let Err(e) = control.terminate() {
                warn!("Failed to terminate session {}: {}", self.name, e);
            }
            info!("Session {} stopped", self.name);
        }
        let dropped = lock(&self.fanout).close();
        if dropped > 0 {
            debug!("Disconnected {} client(s) from session {}", dropped, self.name);
        }
    }

    #[cfg(test)]
    fn broadcast(&self, chunk: &[u8]) {
        lock(&self.fanout).broadcast(chunk);
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background reader: the only writer of the replay buffer and the only fan-out point.
struct Reader {
    name: String,
    output: Box<dyn PtyOutput>,
    running: Arc<AtomicBool>,
    fanout: Arc<Mutex<Fanout>>,
    topic: TopicSlot,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    chunk: usize,
    poll_interval: Duration,
}

impl Reader {
    fn run(mut self) {
        let mut buffer = vec![0u8; self.chunk];
        while self.running.load(Ordering::SeqCst) {
            match self.output.read_timeout(&mut buffer, self.poll_interval) {
                Ok(ReadOutcome::Data(n)) => {
                    let chunk = &buffer[..n];
                    lock(&self.fanout).broadcast(chunk);
                    if let Some(tx) = &self.notify_tx {
                        if notify::current_topic(&self.topic).is_some()
                            && tx.send(chunk.to_vec()).is_err()
                        {
                            debug!("Notification debouncer for {} is gone", self.name);
                        }
                    }
                }
                Ok(ReadOutcome::TimedOut) => continue,
                Ok(ReadOutcome::Eof) => {
                    info!("PTY EOF detected for {} - process has exited", self.name);
                    break;
                }
                Err(e) => {
                    warn!("Error reading PTY output for {}: {}", self.name, e);
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        lock(&self.fanout).close();
        info!("PTY reader thread for {} exiting", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeLauncher, FakePtyHandle, RecordingNotifier};
    use crate::notify::NoopNotifier;
    use std::time::Instant;

    fn start_fake(
        launcher: &FakeLauncher,
        name: &str,
        dir: &str,
    ) -> (Arc<PtySession>, FakePtyHandle) {
        let session = PtySession::start(
            name,
            dir,
            &["agent".to_string()],
            launcher,
            Arc::new(NoopNotifier),
            &EngineConfig::default(),
        )
        .unwrap();
        let handle = launcher.last().unwrap();
        (session, handle)
    }

    fn attach(session: &PtySession) -> (ClientId, Vec<u8>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new(ClientKind::Browser, tx);
        let id = client.id.clone();
        let history = session.add_client(client);
        (id, history, rx)
    }

    async fn next_chunk(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("sink closed")
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn client_ids_are_short_hex() {
        let id = ClientId::random();
        assert_eq!(id.as_str().len(), 8);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(ClientId::random(), ClientId::random());
    }

    #[tokio::test]
    async fn late_joiner_catches_up_then_follows_live_output() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp/work");

        let (_c1, history, mut rx1) = attach(&session);
        assert!(history.is_empty());

        pty.emit("AB");
        pty.emit("CD");
        assert_eq!(next_chunk(&mut rx1).await, b"AB");
        assert_eq!(next_chunk(&mut rx1).await, b"CD");

        let (_c2, history, mut rx2) = attach(&session);
        assert_eq!(history, b"ABCD");

        pty.emit("EF");
        assert_eq!(next_chunk(&mut rx1).await, b"EF");
        assert_eq!(next_chunk(&mut rx2).await, b"EF");
        assert_eq!(session.replay_snapshot(), b"ABCDEF");
        assert_eq!(session.working_dir(), "/tmp/work");
    }

    #[tokio::test]
    async fn attach_during_output_has_no_gap_or_duplicate() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");
        let (_c1, _, mut rx1) = attach(&session);

        let chunks: Vec<Vec<u8>> = (0..200).map(|i| format!("<{}>", i).into_bytes()).collect();
        let expected: Vec<u8> = chunks.concat();

        let emitter = {
            let pty = pty.clone();
            let chunks = chunks.clone();
            std::thread::spawn(move || {
                for chunk in chunks {
                    pty.emit(chunk);
                }
            })
        };

        // Join somewhere in the middle of the stream
        let mut seen = next_chunk(&mut rx1).await;
        seen.extend(next_chunk(&mut rx1).await);
        let (_c2, history, mut rx2) = attach(&session);
        emitter.join().unwrap();

        while seen.len() < expected.len() {
            seen.extend(next_chunk(&mut rx1).await);
        }
        let mut late = history;
        while late.len() < expected.len() {
            late.extend(next_chunk(&mut rx2).await);
        }

        assert_eq!(seen, expected);
        assert_eq!(late, expected);
    }

    #[tokio::test]
    async fn closed_sink_does_not_affect_other_clients() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");

        let (_gone, _, rx_gone) = attach(&session);
        drop(rx_gone);
        let (_alive, _, mut rx) = attach(&session);

        pty.emit("still here");
        assert_eq!(next_chunk(&mut rx).await, b"still here");
        assert!(session.is_running());
    }

    #[test]
    fn remove_client_is_idempotent() {
        let launcher = FakeLauncher::new();
        let (session, _pty) = start_fake(&launcher, "s1", "/tmp");
        let (id, _, _rx) = attach(&session);

        assert_eq!(session.client_count(), 1);
        assert!(session.remove_client(&id));
        assert!(!session.remove_client(&id));
        assert_eq!(session.client_count(), 0);
    }

    #[test]
    fn removed_client_receives_nothing() {
        let launcher = FakeLauncher::new();
        let (session, _pty) = start_fake(&launcher, "s1", "/tmp");
        let (id, _, mut rx) = attach(&session);

        session.remove_client(&id);
        session.broadcast(b"late");
        assert!(rx.try_recv().is_err());
        assert_eq!(session.replay_snapshot(), b"late");
    }

    #[test]
    fn write_reaches_child_verbatim() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");

        assert!(session.write(b"ls\r"));
        assert!(session.write(b"\x1b[A\xff"));
        assert_eq!(pty.written(), b"ls\r\x1b[A\xff");
    }

    #[test]
    fn write_failure_returns_false() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");

        pty.fail_writes(true);
        assert!(!session.write(b"x"));
        assert!(session.is_running());
    }

    #[test]
    fn write_after_stop_returns_false() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");

        session.stop();
        assert!(!session.is_running());
        assert!(pty.is_terminated());
        assert!(!session.write(b"ignored"));
        assert!(pty.written().is_empty());

        // Second stop is a no-op
        session.stop();
    }

    #[test]
    fn process_exit_marks_session_stopped() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");

        pty.emit("bye");
        pty.close();
        wait_until(|| !session.is_running());

        assert_eq!(session.replay_snapshot(), b"bye");
        assert!(!session.write(b"x"));
    }

    #[tokio::test]
    async fn stop_disconnects_clients() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");
        let (_id, _, mut rx) = attach(&session);

        pty.emit("before");
        assert_eq!(next_chunk(&mut rx).await, b"before");

        session.stop();
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sink was not closed");
        assert_eq!(end, None);
        assert_eq!(session.client_count(), 0);
    }

    #[tokio::test]
    async fn process_exit_disconnects_clients() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");
        let (_id, _, mut rx) = attach(&session);

        pty.emit("last words");
        pty.close();
        assert_eq!(next_chunk(&mut rx).await, b"last words");
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("sink was not closed");
        assert_eq!(end, None);
        assert!(!session.is_running());
    }

    #[test]
    fn late_client_of_stopped_session_gets_history_only() {
        let launcher = FakeLauncher::new();
        let (session, _pty) = start_fake(&launcher, "s1", "/tmp");
        session.broadcast(b"old output");
        session.stop();

        let (_id, history, mut rx) = attach(&session);
        assert_eq!(history, b"old output");
        assert_eq!(session.client_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn resize_without_descriptor_is_noop() {
        let launcher = FakeLauncher::new();
        let (session, pty) = start_fake(&launcher, "s1", "/tmp");

        session.resize(40, 120);
        assert_eq!(pty.last_size(), Some((40, 120)));

        session.stop();
        session.resize(10, 10);
        assert_eq!(pty.last_size(), Some((40, 120)));
    }

    #[test]
    fn launch_failure_is_reported() {
        let launcher = FakeLauncher::new();
        launcher.fail_next("no pty available");

        let result = PtySession::start(
            "s1",
            "/tmp",
            &["agent".to_string()],
            launcher.as_ref(),
            Arc::new(NoopNotifier),
            &EngineConfig::default(),
        );
        assert!(matches!(result, Err(PtyError::Launch(_))));
    }

    #[test]
    fn launch_passes_dimensions_and_session_env() {
        let launcher = FakeLauncher::new();
        let (_session, pty) = start_fake(&launcher, "s1", "/srv/app");

        let spec = pty.spec();
        assert_eq!((spec.rows, spec.cols), (24, 80));
        assert_eq!(spec.working_dir, "/srv/app");
        assert!(
            spec.env
                .iter()
                .any(|(k, v)| k == "SHARETTY_SESSION" && v == "s1")
        );
    }

    #[test]
    fn empty_topic_disables_notifications() {
        let launcher = FakeLauncher::new();
        let (session, _pty) = start_fake(&launcher, "s1", "/tmp");

        session.set_notify_topic(Some("alerts".into()));
        assert_eq!(session.notify_topic().as_deref(), Some("alerts"));
        session.set_notify_topic(Some(String::new()));
        assert_eq!(session.notify_topic(), None);
    }

    #[tokio::test]
    async fn quiet_prompt_triggers_one_notification() {
        let launcher = FakeLauncher::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let config = EngineConfig {
            notify: NotifyConfig {
                debounce: Duration::from_millis(50),
                ..NotifyConfig::default()
            },
            ..EngineConfig::default()
        };
        let session = PtySession::start(
            "s1",
            "/tmp",
            &["agent".to_string()],
            launcher.as_ref(),
            notifier.clone(),
            &config,
        )
        .unwrap();
        let pty = launcher.last().unwrap();
        session.set_notify_topic(Some("alerts".into()));

        pty.emit("Proceed? [Y/n] ");
        tokio::time::sleep(Duration::from_millis(500)).await;
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, "Needs confirmation");
        assert_eq!(sent[0].title, "s1");

        // Same burst again, well inside the cooldown
        pty.emit("Proceed? [Y/n] ");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(notifier.sent().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn native_launcher_echoes_input() {
        use crate::launcher::NativeLauncher;

        let dir = std::env::temp_dir();
        let session = PtySession::start(
            "native",
            &dir.to_string_lossy(),
            &["cat".to_string()],
            &NativeLauncher,
            Arc::new(NoopNotifier),
            &EngineConfig::default(),
        )
        .unwrap();
        assert!(session.pid().is_some());

        let (_id, _, mut rx) = attach(&session);
        assert!(session.write(b"ping\n"));

        let mut seen = Vec::new();
        while !String::from_utf8_lossy(&seen).contains("ping") {
            seen.extend(next_chunk(&mut rx).await);
        }

        session.stop();
        assert!(!session.write(b"more"));
    }
}
