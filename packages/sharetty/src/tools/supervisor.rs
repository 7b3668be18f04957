//! Lifecycle of the per-session tool servers.
//!
//! Each instance listens on a private loopback port drawn from a fixed range and runs
//! in its own process group, so stopping it takes its children down too. Instances
//! that see no proxied traffic for the idle timeout are stopped by a periodic sweep.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ToolError;

#[derive(Clone, Debug)]
pub struct ToolConfig {
    pub binary: String,
    /// `<install_dir>/bin/<binary>` wins over PATH
    pub install_dir: PathBuf,
    pub base_port: u16,
    pub max_instances: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub stop_timeout: Duration,
    pub password: Option<String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "code-server".to_string(),
            install_dir: PathBuf::from("."),
            base_port: 8766,
            max_instances: 10,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
            password: None,
        }
    }
}

/// Public view of a live instance
#[derive(Debug, Clone, Serialize)]
pub struct ToolInstanceInfo {
    pub session_id: String,
    pub port: u16,
    pub working_dir: String,
    pub running: bool,
    pub idle_seconds: u64,
    pub started_at: DateTime<Utc>,
}

struct Instance {
    port: u16,
    working_dir: String,
    child: Child,
    started_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Instance {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    fn info(&self, session_id: &str) -> ToolInstanceInfo {
        ToolInstanceInfo {
            session_id: session_id.to_string(),
            port: self.port,
            working_dir: self.working_dir.clone(),
            running: true,
            idle_seconds: self.idle_for(Instant::now()).as_secs(),
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct SupervisorState {
    instances: HashMap<String, Instance>,
    /// Ports of instances being stopped; not reusable until their process is gone
    draining: HashSet<u16>,
}

impl SupervisorState {
    fn reap_dead(&mut self) {
        self.instances.retain(|id, instance| {
            let alive = instance.is_alive();
            if !alive {
                info!("Tool instance for {} exited on its own", id);
            }
            alive
        });
    }

    fn free_port(&self, config: &ToolConfig) -> Option<u16> {
        let used: HashSet<u16> = self.instances.values().map(|i| i.port).collect();
        (0..config.max_instances)
            .filter_map(|offset| config.base_port.checked_add(u16::try_from(offset).ok()?))
            .find(|port| !used.contains(port) && !self.draining.contains(port))
    }
}

pub struct ToolSupervisor {
    config: ToolConfig,
    state: Mutex<SupervisorState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ToolSupervisor {
    pub fn new(config: ToolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SupervisorState::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locate the tool binary: local install first, then PATH.
    pub fn resolve_binary(&self) -> Result<PathBuf, ToolError> {
        let local = self.config.install_dir.join("bin").join(&self.config.binary);
        if local.is_file() {
            return Ok(local);
        }
        which::which(&self.config.binary)
            .map_err(|_| ToolError::BinaryNotFound(self.config.binary.clone()))
    }

    /// Start the tool for `session_id`, or refresh and return the live instance.
    pub fn start(
        &self,
        session_id: &str,
        working_dir: &str,
    ) -> Result<ToolInstanceInfo, ToolError> {
        let mut state = self.lock();

        if let Some(instance) = state.instances.get_mut(session_id) {
            if instance.is_alive() {
                instance.last_activity = Instant::now();
                return Ok(instance.info(session_id));
            }
        }
        state.reap_dead();

        let port = state
            .free_port(&self.config)
            .ok_or(ToolError::ResourceExhausted {
                max: self.config.max_instances,
            })?;
        let binary = self.resolve_binary()?;
        let child = self.spawn(&binary, port, working_dir)?;

        info!(
            "Started tool for session {} on port {} (pid {:?})",
            session_id,
            port,
            child.id()
        );
        let instance = Instance {
            port,
            working_dir: working_dir.to_string(),
            child,
            started_at: Utc::now(),
            last_activity: Instant::now(),
        };
        let info = instance.info(session_id);
        state.instances.insert(session_id.to_string(), instance);
        Ok(info)
    }

    fn spawn(&self, binary: &Path, port: u16, working_dir: &str) -> Result<Child, ToolError> {
        let mut cmd = Command::new(binary);
        cmd.arg("--bind-addr")
            .arg(format!("127.0.0.1:{}", port))
            .arg("--auth")
            .arg(if self.config.password.is_some() {
                "password"
            } else {
                "none"
            })
            .arg("--disable-telemetry")
            .arg("--disable-update-check")
            .arg(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(password) = &self.config.password {
            cmd.env("PASSWORD", password);
        }

        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
            .map_err(|e| ToolError::Launch(format!("{}: {}", binary.display(), e)))
    }

    /// Take the instance out of the map, keeping its port reserved until it is gone.
    /// With `only_if_idle`, an instance that saw activity within the idle timeout
    /// stays put; the check happens under the same lock as the removal.
    fn detach(&self, session_id: &str, only_if_idle: bool) -> Option<Instance> {
        let mut state = self.lock();
        if only_if_idle {
            let now = Instant::now();
            let idle = state
                .instances
                .get(session_id)
                .is_some_and(|instance| instance.idle_for(now) > self.config.idle_timeout);
            if !idle {
                return None;
            }
        }
        let instance = state.instances.remove(session_id)?;
        state.draining.insert(instance.port);
        Some(instance)
    }

    /// Stop the instance for `session_id`. Returns false if nothing was running.
    pub async fn stop(&self, session_id: &str) -> bool {
        match self.detach(session_id, false) {
            Some(instance) => self.shut_down(session_id, instance).await,
            None => false,
        }
    }

    /// Stop the instance only if it is still idle. Returns whether it was removed.
    async fn stop_if_idle(&self, session_id: &str) -> bool {
        match self.detach(session_id, true) {
            Some(instance) => {
                info!("Stopping idle tool instance for session {}", session_id);
                self.shut_down(session_id, instance).await;
                true
            }
            None => false,
        }
    }

    async fn shut_down(&self, session_id: &str, mut instance: Instance) -> bool {
        let was_running = instance.is_alive();
        if was_running {
            terminate_group(&mut instance.child, self.config.stop_timeout).await;
        }
        self.lock().draining.remove(&instance.port);

        info!(
            "Stopped tool for session {} (port {} released)",
            session_id, instance.port
        );
        was_running
    }

    /// Refresh the activity timestamp. Returns false if there is no such instance.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.lock().instances.get_mut(session_id) {
            Some(instance) => {
                instance.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<ToolInstanceInfo> {
        let mut state = self.lock();
        let instance = state.instances.get_mut(session_id)?;
        instance.is_alive().then(|| instance.info(session_id))
    }

    /// Port of the live instance for `session_id`.
    pub fn port_of(&self, session_id: &str) -> Option<u16> {
        self.get(session_id).map(|info| info.port)
    }

    /// Live instances, ordered by port.
    pub fn list(&self) -> Vec<ToolInstanceInfo> {
        let mut state = self.lock();
        let mut list: Vec<ToolInstanceInfo> = state
            .instances
            .iter_mut()
            .filter_map(|(id, instance)| instance.is_alive().then(|| instance.info(id)))
            .collect();
        list.sort_by_key(|info| info.port);
        list
    }

    /// Stop every instance idle for longer than the timeout; returns their ids.
    pub async fn idle_sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let candidates: Vec<String> = self
            .lock()
            .instances
            .iter()
            .filter(|(_, instance)| instance.idle_for(now) > self.config.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        // Activity between the scan and the stop keeps an instance alive
        let mut stopped = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.stop_if_idle(&id).await {
                stopped.push(id);
            }
        }
        stopped
    }

    /// Run `idle_sweep` every sweep interval. Calling this again while a sweeper is
    /// alive does nothing.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let supervisor = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(supervisor) = supervisor.upgrade() else {
                    break;
                };
                let stopped = supervisor.idle_sweep().await;
                if !stopped.is_empty() {
                    info!("Idle sweep stopped {} tool instance(s)", stopped.len());
                }
            }
        }));
    }

    /// Stop the sweeper and every instance (process shutdown).
    pub async fn stop_all(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let ids: Vec<String> = self.lock().instances.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}

/// SIGTERM the process group, wait, then SIGKILL.
async fn terminate_group(child: &mut Child, timeout: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(pid as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                if tokio::time::timeout(timeout, child.wait()).await.is_ok() {
                    return;
                }
                warn!("Tool process {} ignored SIGTERM, killing", pid);
                if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                    debug!("SIGKILL to process group {} failed: {}", pid, e);
                }
            }
            Err(e) => debug!("SIGTERM to process group {} failed: {}", pid, e),
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("Kill of tool process failed: {}", e);
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in tool that just stays alive.
    fn fake_tool(dir: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join("fake-tool");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn supervisor(dir: &Path, base_port: u16, max_instances: usize) -> ToolSupervisor {
        fake_tool(dir, "exec sleep 300");
        ToolSupervisor::new(ToolConfig {
            binary: "fake-tool".into(),
            install_dir: dir.to_path_buf(),
            base_port,
            max_instances,
            idle_timeout: Duration::from_millis(300),
            sweep_interval: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
            password: None,
        })
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path(), 20100, 3);

        let first = sup.start("s1", "/tmp").unwrap();
        let second = sup.start("s1", "/elsewhere").unwrap();

        assert_eq!(first.port, 20100);
        assert_eq!(second.port, first.port);
        assert_eq!(second.working_dir, "/tmp");
        assert_eq!(sup.list().len(), 1);

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn ports_are_unique_and_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path(), 20200, 2);

        let a = sup.start("a", "/tmp").unwrap();
        let b = sup.start("b", "/tmp").unwrap();
        assert_ne!(a.port, b.port);

        let err = sup.start("c", "/tmp").unwrap_err();
        assert!(matches!(err, ToolError::ResourceExhausted { max: 2 }));

        // Stopping frees the port for the next one
        assert!(sup.stop("a").await);
        let c = sup.start("c", "/tmp").unwrap();
        assert_eq!(c.port, a.port);

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn stop_reports_whether_anything_ran() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path(), 20300, 2);

        assert!(!sup.stop("nothing").await);
        sup.start("s1", "/tmp").unwrap();
        assert!(sup.stop("s1").await);
        assert!(sup.get("s1").is_none());
        assert!(!sup.stop("s1").await);
    }

    #[tokio::test]
    async fn stop_escalates_when_term_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        fake_tool(tmp.path(), "trap '' TERM\nwhile true; do sleep 1; done");
        let sup = ToolSupervisor::new(ToolConfig {
            binary: "fake-tool".into(),
            install_dir: tmp.path().to_path_buf(),
            base_port: 20400,
            max_instances: 1,
            stop_timeout: Duration::from_millis(200),
            ..ToolConfig::default()
        });

        sup.start("s1", "/tmp").unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sup.stop("s1").await);
        assert!(sup.list().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = ToolSupervisor::new(ToolConfig {
            binary: "definitely-not-installed-tool-xyz".into(),
            install_dir: tmp.path().to_path_buf(),
            base_port: 20500,
            ..ToolConfig::default()
        });

        let err = sup.start("s1", "/tmp").unwrap_err();
        assert!(matches!(err, ToolError::BinaryNotFound(_)));
        assert!(sup.list().is_empty());
    }

    #[tokio::test]
    async fn dead_instances_are_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        fake_tool(tmp.path(), "exit 0");
        let sup = ToolSupervisor::new(ToolConfig {
            binary: "fake-tool".into(),
            install_dir: tmp.path().to_path_buf(),
            base_port: 20600,
            max_instances: 1,
            ..ToolConfig::default()
        });

        sup.start("s1", "/tmp").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(sup.get("s1").is_none());
        assert!(sup.list().is_empty());

        // The exited instance does not hold on to the only port
        let again = sup.start("s2", "/tmp").unwrap();
        assert_eq!(again.port, 20600);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn idle_sweep_stops_only_idle_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path(), 20700, 3);

        sup.start("old", "/tmp").unwrap();
        sup.start("busy", "/tmp").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        sup.start("fresh", "/tmp").unwrap();
        // Proxied traffic resets the idle clock
        assert!(sup.touch("busy"));

        let stopped = sup.idle_sweep().await;
        assert_eq!(stopped, vec!["old".to_string()]);

        let live: Vec<String> = sup.list().into_iter().map(|i| i.session_id).collect();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&"busy".to_string()));
        assert!(live.contains(&"fresh".to_string()));

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn activity_after_the_scan_keeps_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path(), 20750, 1);

        sup.start("s1", "/tmp").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        // Touched after going idle, just before the sweep gets to it
        assert!(sup.touch("s1"));

        assert!(!sup.stop_if_idle("s1").await);
        assert!(sup.get("s1").is_some());
        assert!(!sup.stop_if_idle("missing").await);

        sup.stop_all().await;
    }

    #[tokio::test]
    async fn background_sweeper_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = Arc::new(supervisor(tmp.path(), 20800, 1));

        sup.start("s1", "/tmp").unwrap();
        sup.spawn_idle_sweeper();
        sup.spawn_idle_sweeper();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(sup.list().is_empty());

        sup.stop_all().await;
    }
}
