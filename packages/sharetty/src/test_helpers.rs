use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pty_session::fake::{FakeLauncher, RecordingNotifier};
use pty_session::{EngineConfig, SessionRegistry};

use crate::AppState;
use crate::auth::AuthState;
use crate::config::{AuthConfig, ServerConfig, ServerFileConfig, SessionDefaults};
use crate::metrics::ServerMetrics;
use crate::tools::{ToolConfig, ToolProxy, ToolSupervisor};

/// Build a fully-wired `AppState` whose sessions run on a [`FakeLauncher`].
///
/// Returns `(AppState, FakeLauncher, TempDir)`; callers must hold the `TempDir`
/// for the lifetime of the test; it is the tool install directory.
pub fn test_app_state() -> (AppState, Arc<FakeLauncher>, tempfile::TempDir) {
    build(AuthConfig::default())
}

pub fn test_app_state_with_password(
    password: &str,
) -> (AppState, Arc<FakeLauncher>, tempfile::TempDir) {
    build(AuthConfig {
        password: Some(password.to_string()),
    })
}

fn build(auth: AuthConfig) -> (AppState, Arc<FakeLauncher>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let launcher = FakeLauncher::new();
    let registry = Arc::new(SessionRegistry::new(
        launcher.clone(),
        Arc::new(RecordingNotifier::default()),
        EngineConfig::default(),
    ));

    let tools = Arc::new(ToolSupervisor::new(ToolConfig {
        binary: "fake-tool".into(),
        install_dir: tmp.path().to_path_buf(),
        ..ToolConfig::default()
    }));
    let proxy = Arc::new(ToolProxy::new(tools.clone()).expect("proxy client"));

    let state = AppState {
        registry,
        tools,
        proxy,
        defaults: Arc::new(SessionDefaults {
            name: "default".into(),
            working_dir: "/tmp".into(),
            command: vec!["agent".into()],
        }),
        server_config: Arc::new(ServerConfig::from_file(&ServerFileConfig::default())),
        auth: AuthState::new(auth),
        metrics: Arc::new(ServerMetrics::new()),
    };
    (state, launcher, tmp)
}

/// Swap in a supervisor whose ports are `base_port..base_port + max`.
pub fn with_tool_ports(state: AppState, dir: &Path, base_port: u16, max: usize) -> AppState {
    with_tools(
        state,
        ToolConfig {
            binary: "fake-tool".into(),
            install_dir: dir.to_path_buf(),
            base_port,
            max_instances: max,
            stop_timeout: Duration::from_secs(2),
            ..ToolConfig::default()
        },
    )
}

/// Swap in a supervisor (and a proxy in front of it) built from `config`.
pub fn with_tools(mut state: AppState, config: ToolConfig) -> AppState {
    let tools = Arc::new(ToolSupervisor::new(config));
    state.proxy = Arc::new(ToolProxy::new(tools.clone()).expect("proxy client"));
    state.tools = tools;
    state
}

/// Install `<dir>/bin/fake-tool`, a stand-in tool server that only sleeps.
pub fn install_fake_tool(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).expect("bin dir");
    let path = bin.join("fake-tool");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 300\n").expect("fake tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}
