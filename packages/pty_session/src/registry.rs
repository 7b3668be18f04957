use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::PtyError;
use crate::launcher::PtyLauncher;
use crate::lock;
use crate::notify::Notifier;
use crate::session::{EngineConfig, PtySession};

/// Listing entry for one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub running: bool,
    pub clients: usize,
    pub working_dir: String,
    pub command: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&PtySession> for SessionSummary {
    fn from(session: &PtySession) -> Self {
        Self {
            id: session.name().to_string(),
            running: session.is_running(),
            clients: session.client_count(),
            working_dir: session.working_dir().to_string(),
            command: session.command().to_vec(),
            created_at: session.created_at(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<PtySession>>,
    default: Option<String>,
}

/// Named collection of sessions, one per server.
pub struct SessionRegistry {
    launcher: Arc<dyn PtyLauncher>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(
        launcher: Arc<dyn PtyLauncher>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            launcher,
            notifier,
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Return the session called `name`, launching it if it does not exist yet.
    ///
    /// An existing session is returned as is; `working_dir` and `command` only apply
    /// to a fresh launch.
    pub fn get_or_create(
        &self,
        name: &str,
        working_dir: &str,
        command: &[String],
    ) -> Result<Arc<PtySession>, PtyError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        // Launch outside the lock; a concurrent creator may win the insert
        let session = PtySession::start(
            name,
            working_dir,
            command,
            self.launcher.as_ref(),
            self.notifier.clone(),
            &self.config,
        )?;

        let mut state = lock(&self.state);
        if let Some(existing) = state.sessions.get(name).cloned() {
            drop(state);
            warn!("Session {} was created concurrently, discarding duplicate", name);
            session.stop();
            return Ok(existing);
        }
        state.sessions.insert(name.to_string(), session.clone());
        if state.default.is_none() {
            state.default = Some(name.to_string());
        }
        info!("Registered session {}", name);
        Ok(session)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PtySession>> {
        lock(&self.state).sessions.get(name).cloned()
    }

    pub fn get_default(&self) -> Option<Arc<PtySession>> {
        let state = lock(&self.state);
        state
            .default
            .as_ref()
            .and_then(|name| state.sessions.get(name))
            .cloned()
    }

    pub fn default_name(&self) -> Option<String> {
        lock(&self.state).default.clone()
    }

    /// `None` means the default session; any given id, even an empty one, is looked
    /// up literally.
    pub fn resolve(&self, id: Option<&str>) -> Option<Arc<PtySession>> {
        match id {
            Some(id) => self.get(id),
            None => self.get_default(),
        }
    }

    /// Summaries of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<PtySession>> = lock(&self.state).sessions.values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|s| SessionSummary::from(s.as_ref()))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn len(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop and forget a session. Returns false if it did not exist.
    pub fn delete(&self, name: &str) -> bool {
        let removed = {
            let mut state = lock(&self.state);
            let removed = state.sessions.remove(name);
            if removed.is_some() && state.default.as_deref() == Some(name) {
                state.default = None;
            }
            removed
        };

        match removed {
            Some(session) => {
                session.stop();
                info!("Deleted session {}", name);
                true
            }
            None => false,
        }
    }

    /// Stop and relaunch `name` with its last known working directory and command.
    /// The fallbacks apply when no such session exists.
    pub fn restart(
        &self,
        name: &str,
        fallback_dir: &str,
        fallback_command: &[String],
    ) -> Result<Arc<PtySession>, PtyError> {
        let previous = self.get(name);
        let (working_dir, command, topic) = match &previous {
            Some(session) => (
                session.working_dir().to_string(),
                session.command().to_vec(),
                session.notify_topic(),
            ),
            None => (fallback_dir.to_string(), fallback_command.to_vec(), None),
        };
        drop(previous);

        self.delete(name);
        let session = self.get_or_create(name, &working_dir, &command)?;
        if topic.is_some() {
            session.set_notify_topic(topic);
        }
        info!("Restarted session {} in {}", name, working_dir);
        Ok(session)
    }

    /// Stop every session; used on process shutdown.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<PtySession>> = {
            let mut state = lock(&self.state);
            state.default = None;
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.stop();
        }
        info!("Stopped {} session(s)", sessions.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeLauncher;
    use crate::notify::NoopNotifier;

    fn registry() -> (SessionRegistry, Arc<FakeLauncher>) {
        let launcher = FakeLauncher::new();
        let registry = SessionRegistry::new(
            launcher.clone(),
            Arc::new(NoopNotifier),
            EngineConfig::default(),
        );
        (registry, launcher)
    }

    fn cmd() -> Vec<String> {
        vec!["agent".to_string(), "--verbose".to_string()]
    }

    #[test]
    fn get_or_create_is_idempotent_by_name() {
        let (registry, launcher) = registry();

        let first = registry.get_or_create("x", "/dirA", &cmd()).unwrap();
        let second = registry.get_or_create("x", "/dirB", &cmd()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.working_dir(), "/dirA");
        assert_eq!(launcher.launches(), 1);
    }

    #[test]
    fn first_session_becomes_default() {
        let (registry, _) = registry();

        registry.get_or_create("a", "/tmp", &cmd()).unwrap();
        registry.get_or_create("b", "/tmp", &cmd()).unwrap();

        assert_eq!(registry.default_name().as_deref(), Some("a"));
        assert_eq!(registry.get_default().unwrap().name(), "a");
    }

    #[test]
    fn delete_clears_default() {
        let (registry, launcher) = registry();
        registry.get_or_create("a", "/tmp", &cmd()).unwrap();
        let pty = launcher.last().unwrap();

        assert!(registry.delete("a"));
        assert!(pty.is_terminated());
        assert!(registry.get_default().is_none());
        assert!(!registry.delete("a"));

        // The next creation takes over as default
        registry.get_or_create("b", "/tmp", &cmd()).unwrap();
        assert_eq!(registry.default_name().as_deref(), Some("b"));
    }

    #[test]
    fn resolve_never_conflates_empty_and_absent() {
        let (registry, _) = registry();
        registry.get_or_create("main", "/tmp", &cmd()).unwrap();

        assert_eq!(registry.resolve(None).unwrap().name(), "main");
        assert!(registry.resolve(Some("")).is_none());
        assert_eq!(registry.resolve(Some("main")).unwrap().name(), "main");
        assert!(registry.resolve(Some("other")).is_none());
    }

    #[test]
    fn launch_failure_leaves_registry_untouched() {
        let (registry, launcher) = registry();
        launcher.fail_next("boom");

        let result = registry.get_or_create("a", "/tmp", &cmd());
        assert!(matches!(result, Err(PtyError::Launch(_))));
        assert!(registry.is_empty());
        assert!(registry.default_name().is_none());
    }

    #[test]
    fn list_reports_every_session() {
        let (registry, _) = registry();
        let a = registry.get_or_create("a", "/one", &cmd()).unwrap();
        registry.get_or_create("b", "/two", &cmd()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        a.add_client(crate::session::Client::new(
            crate::session::ClientKind::Terminal,
            tx,
        ));

        let list = registry.list();
        assert_eq!(list.len(), 2);
        let a = list.iter().find(|s| s.id == "a").unwrap();
        assert!(a.running);
        assert_eq!(a.clients, 1);
        assert_eq!(a.working_dir, "/one");
        assert_eq!(a.command, cmd());
    }

    #[test]
    fn restart_relaunches_with_previous_settings() {
        let (registry, launcher) = registry();
        let old = registry.get_or_create("a", "/work", &cmd()).unwrap();
        old.set_notify_topic(Some("alerts".into()));
        let old_pty = launcher.last().unwrap();

        let new = registry.restart("a", "/fallback", &["sh".to_string()]).unwrap();

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old_pty.is_terminated());
        assert_eq!(new.working_dir(), "/work");
        assert_eq!(new.command(), cmd().as_slice());
        assert_eq!(new.notify_topic().as_deref(), Some("alerts"));
        assert_eq!(registry.default_name().as_deref(), Some("a"));
        assert_eq!(launcher.launches(), 2);
    }

    #[test]
    fn restart_unknown_uses_fallbacks() {
        let (registry, _) = registry();
        let session = registry
            .restart("fresh", "/fallback", &["sh".to_string()])
            .unwrap();
        assert_eq!(session.working_dir(), "/fallback");
        assert_eq!(session.command(), ["sh".to_string()].as_slice());
    }

    #[test]
    fn concurrent_creation_keeps_one_engine() {
        let (registry, launcher) = registry();
        let registry = Arc::new(registry);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create("same", "/tmp", &cmd()).unwrap())
            })
            .collect();
        let sessions: Vec<Arc<PtySession>> =
            threads.into_iter().map(|t| t.join().unwrap()).collect();

        for session in &sessions[1..] {
            assert!(Arc::ptr_eq(&sessions[0], session));
        }
        assert_eq!(registry.len(), 1);

        // Losers of the race were launched and stopped again
        let live = launcher
            .handles()
            .iter()
            .filter(|h| !h.is_terminated())
            .count();
        assert_eq!(live, 1);
        assert!(sessions[0].is_running());
    }

    #[test]
    fn shutdown_stops_everything() {
        let (registry, _) = registry();
        let a = registry.get_or_create("a", "/tmp", &cmd()).unwrap();
        let b = registry.get_or_create("b", "/tmp", &cmd()).unwrap();

        registry.shutdown();

        assert!(!a.is_running());
        assert!(!b.is_running());
        assert!(registry.is_empty());
        assert!(registry.get_default().is_none());
    }
}
