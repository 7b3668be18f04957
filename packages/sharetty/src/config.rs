use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use pty_session::{EngineConfig, NotifyConfig};

use crate::tools::ToolConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [auth]
//                    password = "hunter2"
//
//   env var:         SHARETTY_AUTH__PASSWORD=hunter2   (double underscore = nesting)
//
//   (single underscore stays within field names: SHARETTY_TOOLS__BASE_PORT)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub notify: NotifyFileConfig,
    #[serde(default)]
    pub tools: ToolsFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Terminal session settings (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Name of the session started at boot
    #[serde(default = "default_session_name")]
    pub default_name: String,
    /// Defaults to the server's current directory
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_replay_bytes")]
    pub replay_bytes: usize,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            default_name: default_session_name(),
            working_dir: None,
            command: default_command(),
            extra_args: Vec::new(),
            replay_bytes: default_replay_bytes(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

/// Idle-output notification settings (lives under `[notify]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyFileConfig {
    #[serde(default = "default_ntfy_url")]
    pub ntfy_url: String,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyFileConfig {
    fn default() -> Self {
        Self {
            ntfy_url: default_ntfy_url(),
            debounce_ms: default_debounce_ms(),
            cooldown_ms: default_cooldown_ms(),
            buffer_bytes: default_buffer_bytes(),
            min_text_len: default_min_text_len(),
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

/// Auxiliary tool server settings (lives under `[tools]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsFileConfig {
    #[serde(default = "default_tool_binary")]
    pub binary: String,
    /// Checked for `bin/<binary>` before PATH; defaults to the data directory
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for ToolsFileConfig {
    fn default() -> Self {
        Self {
            binary: default_tool_binary(),
            install_dir: None,
            base_port: default_base_port(),
            max_instances: default_max_instances(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Auth settings (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// No password (or an empty one) disables authentication entirely
    #[serde(default)]
    pub password: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_session_name() -> String {
    "default".to_string()
}
fn default_command() -> Vec<String> {
    vec!["claude".to_string()]
}
fn default_replay_bytes() -> usize {
    pty_session::replay::DEFAULT_REPLAY_CAP
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_ntfy_url() -> String {
    "https://ntfy.sh".to_string()
}
fn default_debounce_ms() -> u64 {
    2000
}
fn default_cooldown_ms() -> u64 {
    3000
}
fn default_buffer_bytes() -> usize {
    2048
}
fn default_min_text_len() -> usize {
    5
}
fn default_notify_timeout_secs() -> u64 {
    5
}
fn default_tool_binary() -> String {
    "code-server".to_string()
}
fn default_base_port() -> u16 {
    8766
}
fn default_max_instances() -> usize {
    10
}
fn default_idle_timeout_secs() -> u64 {
    30 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_stop_timeout_secs() -> u64 {
    5
}

/// Build a figment that layers: defaults → config.toml → SHARETTY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SHARETTY_AUTH__PASSWORD=secret`  →  `auth.password = "secret"`
///   `SHARETTY_TOOLS__BASE_PORT=9000`  →  `tools.base_port = 9000`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SHARETTY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// What the default and API-created sessions launch.
#[derive(Clone, Debug)]
pub struct SessionDefaults {
    pub name: String,
    pub working_dir: String,
    /// Full argument vector, extra args included
    pub command: Vec<String>,
}

impl SessionDefaults {
    pub fn from_file(fc: &SessionFileConfig, fallback_dir: &Path) -> Self {
        let working_dir = fc
            .working_dir
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| fallback_dir.to_string_lossy().into_owned());
        let mut command = fc.command.clone();
        command.extend(fc.extra_args.iter().cloned());
        Self {
            name: fc.default_name.clone(),
            working_dir,
            command,
        }
    }

    /// Launch command for a session created with additional arguments.
    pub fn command_with(&self, extra_args: &[String]) -> Vec<String> {
        let mut command = self.command.clone();
        command.extend(extra_args.iter().cloned());
        command
    }
}

pub fn engine_config(session: &SessionFileConfig, notify: &NotifyFileConfig) -> EngineConfig {
    EngineConfig {
        replay_cap: session.replay_bytes,
        rows: session.rows,
        cols: session.cols,
        notify: NotifyConfig {
            debounce: Duration::from_millis(notify.debounce_ms),
            cooldown: Duration::from_millis(notify.cooldown_ms),
            buffer_bytes: notify.buffer_bytes,
            min_text_len: notify.min_text_len,
        },
        ..EngineConfig::default()
    }
}

pub fn tool_config(fc: &ToolsFileConfig, data_dir: &Path, password: Option<String>) -> ToolConfig {
    ToolConfig {
        binary: fc.binary.clone(),
        install_dir: fc
            .install_dir
            .clone()
            .unwrap_or_else(|| data_dir.to_path_buf()),
        base_port: fc.base_port,
        max_instances: fc.max_instances,
        idle_timeout: Duration::from_secs(fc.idle_timeout_secs),
        sweep_interval: Duration::from_secs(fc.sweep_interval_secs.max(1)),
        stop_timeout: Duration::from_secs(fc.stop_timeout_secs),
        password,
    }
}

/// Listener settings after CLI overrides.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Authentication configuration (runtime view).
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub password: Option<String>,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            password: fc.password.clone().filter(|p| !p.is_empty()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.password.is_some()
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SharettyConfig {
    pub data_dir: PathBuf,
}

impl SharettyConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".sharetty"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
