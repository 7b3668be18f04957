pub mod auth;
pub mod health;
pub mod notify;
pub mod sessions;
pub mod tools;

// Re-export all handlers for easy route registration
pub use auth::{auth_status, login, logout};
pub use health::{health_handler, metrics_handler};
pub use notify::{get_notify_topic, set_notify_topic};
pub use sessions::{
    create_session, delete_session, get_attach_command, get_status, list_sessions,
    restart_session,
};
pub use tools::{
    list_tools, start_tool, stop_tool, tool_proxy_bare, tool_proxy_path, tool_proxy_root,
    tool_status,
};
