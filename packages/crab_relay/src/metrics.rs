//! Relay metrics for observability
//!
//! Provides runtime counters for monitoring relay health and throughput.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Message metrics
    /// Frames received from clients
    pub frames_received: AtomicU64,
    /// Text messages fanned out
    pub texts_relayed: AtomicU64,
    /// Individual deliveries queued to recipients
    pub deliveries: AtomicU64,

    // File metrics
    pub files_completed: AtomicU64,
    pub files_persisted: AtomicU64,
    pub transfers_interrupted: AtomicU64,

    // Error metrics
    /// Sends that failed and dropped a recipient
    pub send_failures: AtomicU64,
    /// Framing violations reported back to their connection
    pub protocol_errors: AtomicU64,
    /// Failed writes to the persistence directory
    pub persist_errors: AtomicU64,
    /// Whether the most recent persist attempt failed
    last_persist_failed: AtomicBool,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn text_relayed(&self) {
        self.texts_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self, n: usize) {
        self.deliveries.fetch_add(n as u64, Ordering::Relaxed);
    }

    // File tracking
    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_persisted(&self) {
        self.files_persisted.fetch_add(1, Ordering::Relaxed);
        self.last_persist_failed.store(false, Ordering::Relaxed);
    }

    pub fn transfer_interrupted(&self) {
        self.transfers_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persist_error(&self) {
        self.persist_errors.fetch_add(1, Ordering::Relaxed);
        self.last_persist_failed.store(true, Ordering::Relaxed);
    }

    /// True while the latest persist attempt is a failure. A later
    /// successful store clears it.
    pub fn persist_degraded(&self) -> bool {
        self.last_persist_failed.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                texts_relayed: self.texts_relayed.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
            },
            files: FileMetrics {
                completed: self.files_completed.load(Ordering::Relaxed),
                persisted: self.files_persisted.load(Ordering::Relaxed),
                interrupted: self.transfers_interrupted.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                send: self.send_failures.load(Ordering::Relaxed),
                protocol: self.protocol_errors.load(Ordering::Relaxed),
                persist: self.persist_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub files: FileMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub texts_relayed: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetrics {
    pub completed: u64,
    pub persisted: u64,
    pub interrupted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub send: u64,
    pub protocol: u64,
    pub persist: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_degraded_follows_latest_outcome() {
        let metrics = RelayMetrics::new();
        assert!(!metrics.persist_degraded());

        metrics.persist_error();
        assert!(metrics.persist_degraded());

        metrics.file_persisted();
        assert!(!metrics.persist_degraded());
        // The cumulative counter keeps the history
        assert_eq!(metrics.snapshot().errors.persist, 1);
    }

    #[test]
    fn test_connection_tracking() {
        let metrics = RelayMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_file_tracking() {
        let metrics = RelayMetrics::new();

        metrics.file_completed();
        metrics.file_completed();
        metrics.file_persisted();
        metrics.transfer_interrupted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.files.completed, 2);
        assert_eq!(snapshot.files.persisted, 1);
        assert_eq!(snapshot.files.interrupted, 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = RelayMetrics::new();
        metrics.connection_opened();
        metrics.frame_received();
        metrics.text_relayed();
        metrics.delivered(3);
        metrics.send_failed();
        metrics.protocol_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.texts_relayed, 1);
        assert_eq!(snapshot.messages.deliveries, 3);
        assert_eq!(snapshot.errors.send, 1);
        assert_eq!(snapshot.errors.protocol, 1);
        assert_eq!(snapshot.errors.persist, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(RelayMetrics::new().snapshot()).unwrap();
        assert_eq!(json["connections"]["active"], 0);
        assert!(json["errors"].is_object());
    }
}
