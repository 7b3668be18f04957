use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.list();
    let running = sessions.iter().filter(|s| s.running).count() as u64;
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.launch == 0 && metrics.errors.proxy == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        sessions: metrics::SessionHealth {
            total: sessions.len() as u64,
            running,
        },
        tools: state.tools.list().len() as u64,
        connections: metrics.connections.active,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
