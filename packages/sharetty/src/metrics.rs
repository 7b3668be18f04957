//! Server metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Terminal connections
    /// Currently attached terminal/browser clients
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Sessions
    pub sessions_created: AtomicU64,
    pub sessions_stopped: AtomicU64,

    // Relay traffic
    /// Frames received from clients
    pub frames_received: AtomicU64,
    /// Bytes of catch-up history sent at attach
    pub history_bytes_sent: AtomicU64,

    // Tool proxy
    pub proxied_requests: AtomicU64,
    pub active_tunnels: AtomicU64,
    pub proxy_errors: AtomicU64,

    pub launch_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn history_sent(&self, bytes: usize) {
        self.history_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn request_proxied(&self) {
        self.proxied_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.active_tunnels.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn proxy_error(&self) {
        self.proxy_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn launch_error(&self) {
        self.launch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                created: self.sessions_created.load(Ordering::Relaxed),
                stopped: self.sessions_stopped.load(Ordering::Relaxed),
            },
            relay: RelayMetrics {
                frames_received: self.frames_received.load(Ordering::Relaxed),
                history_bytes_sent: self.history_bytes_sent.load(Ordering::Relaxed),
            },
            proxy: ProxyMetrics {
                requests: self.proxied_requests.load(Ordering::Relaxed),
                active_tunnels: self.active_tunnels.load(Ordering::Relaxed),
                errors: self.proxy_errors.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                launch: self.launch_errors.load(Ordering::Relaxed),
                proxy: self.proxy_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub relay: RelayMetrics,
    pub proxy: ProxyMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub created: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub frames_received: u64,
    pub history_bytes_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMetrics {
    pub requests: u64,
    pub active_tunnels: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub launch: u64,
    pub proxy: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub tools: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub total: u64,
    pub running: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_tunnel_tracking() {
        let metrics = ServerMetrics::new();

        metrics.tunnel_opened();
        metrics.request_proxied();
        metrics.tunnel_closed();
        metrics.proxy_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.proxy.active_tunnels, 0);
        assert_eq!(snapshot.proxy.requests, 1);
        assert_eq!(snapshot.errors.proxy, 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.session_created();
        metrics.history_sent(128);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.sessions.created, 1);
        assert_eq!(snapshot.relay.history_bytes_sent, 128);
    }
}
