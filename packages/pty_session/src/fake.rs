//! In-memory launcher and notifier for tests.
//!
//! A [`FakeLauncher`] never starts a process. Every launch yields a [`FakePtyHandle`]
//! through which a test plays the child: it emits output, closes the stream, and
//! inspects what the engine wrote or how it resized the terminal.

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PtyError;
use crate::launcher::{LaunchSpec, LaunchedPty, PtyControl, PtyLauncher, PtyOutput, ReadOutcome};
use crate::notify::Notifier;

static NEXT_PID: AtomicU32 = AtomicU32::new(40_000);

enum FakeEvent {
    Chunk(Vec<u8>),
    Eof,
}

struct FakeShared {
    spec: LaunchSpec,
    pid: u32,
    written: Mutex<Vec<u8>>,
    size: Mutex<Option<(u16, u16)>>,
    terminated: AtomicBool,
    fail_writes: AtomicBool,
}

/// Test-side view of one fake terminal.
#[derive(Clone)]
pub struct FakePtyHandle {
    shared: Arc<FakeShared>,
    events: Sender<FakeEvent>,
}

impl FakePtyHandle {
    /// Make the "child" print `data`.
    pub fn emit(&self, data: impl Into<Vec<u8>>) {
        let _ = self.events.send(FakeEvent::Chunk(data.into()));
    }

    /// End the output stream, as if the child exited.
    pub fn close(&self) {
        let _ = self.events.send(FakeEvent::Eof);
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().unwrap().clone()
    }

    pub fn last_size(&self) -> Option<(u16, u16)> {
        *self.shared.size.lock().unwrap()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Make every subsequent input write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.shared.spec
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }
}

#[derive(Default)]
struct LauncherState {
    handles: Vec<FakePtyHandle>,
    fail_next: Option<String>,
}

#[derive(Default)]
pub struct FakeLauncher {
    state: Mutex<LauncherState>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next launch fail with `reason`.
    pub fn fail_next(&self, reason: &str) {
        self.state.lock().unwrap().fail_next = Some(reason.to_string());
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().handles.len()
    }

    pub fn handles(&self) -> Vec<FakePtyHandle> {
        self.state.lock().unwrap().handles.clone()
    }

    /// Handle of the most recent launch.
    pub fn last(&self) -> Option<FakePtyHandle> {
        self.state.lock().unwrap().handles.last().cloned()
    }
}

impl PtyLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedPty, PtyError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_next.take() {
            return Err(PtyError::Launch(reason));
        }
        if spec.command.is_empty() {
            return Err(PtyError::Launch("empty command".into()));
        }

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(FakeShared {
            spec: spec.clone(),
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            written: Mutex::new(Vec::new()),
            size: Mutex::new(None),
            terminated: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        });
        state.handles.push(FakePtyHandle {
            shared: shared.clone(),
            events: tx.clone(),
        });

        Ok(LaunchedPty {
            output: Box::new(FakeOutput {
                events: rx,
                pending: Vec::new(),
            }),
            control: Box::new(FakeControl { shared, events: tx }),
        })
    }
}

struct FakeOutput {
    events: Receiver<FakeEvent>,
    pending: Vec<u8>,
}

impl FakeOutput {
    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

impl PtyOutput for FakeOutput {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ReadOutcome> {
        if !self.pending.is_empty() {
            return Ok(ReadOutcome::Data(self.drain_pending(buf)));
        }
        match self.events.recv_timeout(timeout) {
            Ok(FakeEvent::Chunk(data)) if data.is_empty() => Ok(ReadOutcome::TimedOut),
            Ok(FakeEvent::Chunk(data)) => {
                self.pending = data;
                Ok(ReadOutcome::Data(self.drain_pending(buf)))
            }
            Ok(FakeEvent::Eof) | Err(RecvTimeoutError::Disconnected) => Ok(ReadOutcome::Eof),
            Err(RecvTimeoutError::Timeout) => Ok(ReadOutcome::TimedOut),
        }
    }
}

struct FakeControl {
    shared: Arc<FakeShared>,
    events: Sender<FakeEvent>,
}

impl PtyControl for FakeControl {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.shared.terminated.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        self.shared.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        *self.shared.size.lock().unwrap() = Some((rows, cols));
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), PtyError> {
        if !self.shared.terminated.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(FakeEvent::Eof);
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.shared.pid)
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub topic: String,
    pub title: String,
    pub message: String,
}

/// Notifier that records deliveries instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingNotifier {
    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, topic: &str, title: &str, message: &str) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("delivery refused");
        }
        self.sent.lock().unwrap().push(SentNotification {
            topic: topic.to_string(),
            title: title.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
