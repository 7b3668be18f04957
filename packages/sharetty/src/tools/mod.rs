//! Auxiliary tool servers (one per session) and the reverse proxy in front of them.

pub mod proxy;
pub mod supervisor;

pub use proxy::ToolProxy;
pub use supervisor::{ToolConfig, ToolInstanceInfo, ToolSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Every port in the configured range is taken
    #[error("no free port for another tool instance (limit {max})")]
    ResourceExhausted { max: usize },
    /// Tool binary neither installed locally nor on PATH
    #[error("tool binary not found: {0}")]
    BinaryNotFound(String),
    #[error("failed to launch tool: {0}")]
    Launch(String),
    /// No live instance, or its port refused the connection
    #[error("tool server unavailable for session {0}")]
    ProxyUnavailable(String),
    #[error("proxy error: {0}")]
    Proxy(String),
}
