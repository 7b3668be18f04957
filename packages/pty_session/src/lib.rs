//! Shared PTY sessions
//!
//! This crate owns the interactive side of sharetty: a child process on a
//! pseudo-terminal whose output is fanned out to any number of clients, with a
//! bounded replay history for late joiners and idle-output notifications.
//! It has no HTTP dependencies.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pty_session::{
//!     Client, ClientKind, EngineConfig, NativeLauncher, NoopNotifier, SessionRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = SessionRegistry::new(
//!         Arc::new(NativeLauncher),
//!         Arc::new(NoopNotifier),
//!         EngineConfig::default(),
//!     );
//!
//!     let session = registry
//!         .get_or_create("main", "/tmp", &["/bin/bash".to_string()])
//!         .unwrap();
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let history = session.add_client(Client::new(ClientKind::Terminal, tx));
//!     println!("catch-up: {} bytes", history.len());
//!
//!     session.write(b"echo hello\n");
//!     while let Some(chunk) = rx.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//! }
//! ```

mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod launcher;
pub mod notify;
pub mod registry;
pub mod replay;
pub mod session;

pub use error::PtyError;
pub use launcher::{
    LaunchSpec, LaunchedPty, NativeLauncher, PtyControl, PtyLauncher, PtyOutput, ReadOutcome,
};
pub use notify::{NoopNotifier, Notifier, NotifyConfig};
pub use registry::{SessionRegistry, SessionSummary};
pub use replay::ReplayBuffer;
pub use session::{Client, ClientId, ClientKind, EngineConfig, PtySession};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
