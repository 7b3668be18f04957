use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{any, delete, get, post},
};
use clap::{Parser, Subcommand};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
#[cfg(unix)]
mod cli;
mod config;
mod error;
mod handlers;
mod metrics;
mod notify;
mod relay;
#[cfg(test)]
mod test_helpers;
mod tools;

use pty_session::{NativeLauncher, SessionRegistry};

use crate::auth::AuthState;
use crate::config::{AuthConfig, FileConfig, ServerConfig, SessionDefaults, SharettyConfig};
use crate::metrics::ServerMetrics;
use crate::notify::NtfyNotifier;
use crate::tools::{ToolProxy, ToolSupervisor};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "sharetty")]
#[command(about = "Share one terminal session between terminal and browser clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.sharetty)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground (the default)
    Server(ServerArgs),

    /// Attach this terminal to a running session
    #[cfg(unix)]
    Attach(AttachArgs),
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Working directory of the default session (defaults to the current directory)
    #[arg(short, long)]
    working_dir: Option<String>,

    /// Name of the session started at boot
    #[arg(short, long)]
    session: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Extra arguments appended to the session command (after `--`)
    #[arg(last = true)]
    extra_args: Vec<String>,
}

#[cfg(unix)]
#[derive(Parser)]
struct AttachArgs {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long, default_value = "8765")]
    port: u16,

    /// Session to attach to (default: the server's default session)
    #[arg(short, long)]
    session: Option<String>,

    /// Password, when the server requires one (or set SHARETTY_PASSWORD)
    #[arg(short = 'P', long)]
    password: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub tools: Arc<ToolSupervisor>,
    pub proxy: Arc<ToolProxy>,
    /// What new sessions launch, and where
    pub defaults: Arc<SessionDefaults>,
    pub server_config: Arc<ServerConfig>,
    pub auth: AuthState,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run_server(ServerArgs::default(), cli.data_dir).await,
        Some(Commands::Server(args)) => run_server(args, cli.data_dir).await,
        #[cfg(unix)]
        Some(Commands::Attach(args)) => {
            let password = args
                .password
                .or_else(|| std::env::var("SHARETTY_PASSWORD").ok());
            let server = cli::ServerAddr {
                host: args.host,
                port: args.port,
            };
            cli::attach_command(server, args.session, password).await
        }
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "sharetty=debug,pty_session=debug,tower_http=debug,info"
    } else {
        "sharetty=info,pty_session=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

/// All HTTP and WebSocket routes. Auth is layered on only when a password is set.
fn build_router(state: AppState) -> Router {
    let mut app = Router::new()
        // Session routes
        .route(
            "/api/sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route("/api/sessions/restart", post(handlers::restart_session))
        .route("/api/sessions/{id}", delete(handlers::delete_session))
        .route(
            "/api/sessions/{id}/notify",
            get(handlers::get_notify_topic).put(handlers::set_notify_topic),
        )
        .route("/api/status", get(handlers::get_status))
        .route("/api/attach-command", get(handlers::get_attach_command))
        // Terminal relay
        .route("/ws/terminal", get(relay::terminal_ws_handler))
        // Tool servers
        .route("/api/tools", get(handlers::list_tools))
        .route("/api/tools/{id}/start", post(handlers::start_tool))
        .route("/api/tools/{id}/stop", post(handlers::stop_tool))
        .route("/api/tools/{id}/status", get(handlers::tool_status))
        .route("/tool/{id}", any(handlers::tool_proxy_bare))
        .route("/tool/{id}/", any(handlers::tool_proxy_root))
        .route("/tool/{id}/{*path}", any(handlers::tool_proxy_path))
        // Auth
        .route("/api/auth/status", get(handlers::auth_status))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/auth/logout", post(handlers::logout))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler));

    if state.auth.config.enabled() {
        app = app.layer(axum::middleware::from_fn_with_state(
            state.auth.clone(),
            auth::auth_middleware,
        ));
    }

    app.layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Defaults for the boot session and API-created ones. The boot session name goes
/// through the same check as ids posted to the API.
fn session_defaults(file_config: &FileConfig, cwd: &Path) -> Result<SessionDefaults> {
    let defaults = SessionDefaults::from_file(&file_config.session, cwd);
    handlers::sessions::validate_session_id(&defaults.name)
        .with_context(|| format!("Invalid default session name {:?}", defaults.name))?;
    Ok(defaults)
}

async fn run_server(args: ServerArgs, data_dir: Option<PathBuf>) -> Result<()> {
    init_logging(args.debug);

    info!("Starting sharetty");

    let config = SharettyConfig::new(data_dir)?;
    let mut file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Invalid configuration in {}",
                config.config_toml_path().display()
            )
        })?;

    // CLI flags win over config.toml and env
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(dir) = args.working_dir {
        file_config.session.working_dir = Some(dir);
    }
    if let Some(name) = args.session {
        file_config.session.default_name = name;
    }
    file_config.session.extra_args.extend(args.extra_args);

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let defaults = Arc::new(session_defaults(&file_config, &cwd)?);
    let server_config = Arc::new(ServerConfig::from_file(&file_config.server));
    let auth_config = AuthConfig::from_file(&file_config.auth);
    if auth_config.enabled() {
        info!("Authentication ENABLED");
    } else {
        info!("Authentication disabled (set SHARETTY_AUTH__PASSWORD to enable)");
    }

    let notifier = Arc::new(NtfyNotifier::new(
        &file_config.notify.ntfy_url,
        std::time::Duration::from_secs(file_config.notify.timeout_secs),
    )?);
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(NativeLauncher),
        notifier,
        config::engine_config(&file_config.session, &file_config.notify),
    ));

    let tools = Arc::new(ToolSupervisor::new(config::tool_config(
        &file_config.tools,
        &config.data_dir,
        auth_config.password.clone(),
    )));
    tools.spawn_idle_sweeper();
    let proxy = Arc::new(ToolProxy::new(tools.clone())?);

    let metrics = Arc::new(ServerMetrics::new());

    // The default session; the server stays up without it
    match registry.get_or_create(&defaults.name, &defaults.working_dir, &defaults.command) {
        Ok(session) => {
            metrics.session_created();
            info!(
                "Started session {} in {}: {}",
                session.name(),
                session.working_dir(),
                session.command().join(" ")
            );
        }
        Err(e) => {
            metrics.launch_error();
            warn!("Could not start default session: {}", e);
        }
    }

    let app_state = AppState {
        registry: registry.clone(),
        tools: tools.clone(),
        proxy,
        defaults,
        server_config: server_config.clone(),
        auth: AuthState::new(auth_config),
        metrics,
    };
    let app = build_router(app_state);

    let addr = server_config
        .bind_addr()
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}", server_config.bind_addr()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("sharetty listening on http://{}", actual_addr);
    info!("Attach from a terminal: sharetty attach --port {}", actual_addr.port());

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping tool servers...");
    tools.stop_all().await;

    info!("Stopping sessions...");
    registry.shutdown();

    info!("Shutdown complete");
    server_result
}
