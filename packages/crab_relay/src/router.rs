//! Fan-out of one message to every other registered connection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{ConnectionId, Outbound};
use crate::metrics::RelayMetrics;
use crate::registry::ConnectionRegistry;

/// Outcome of one broadcast, for logging. Never surfaced to the sender.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Best-effort broadcaster over a [`ConnectionRegistry`].
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<RelayMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Queue `message` once on every connection except `origin`.
    ///
    /// Recipients whose send fails are closed and, after the pass, removed
    /// from the registry together. No retry.
    pub async fn broadcast(&self, message: Outbound, origin: &ConnectionId) -> BroadcastReport {
        let targets = self.registry.snapshot_excluding(origin).await;
        let mut report = BroadcastReport::default();
        let mut defunct: Vec<ConnectionId> = Vec::new();

        for conn in &targets {
            report.attempted += 1;
            match conn.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    warn!(
                        conn_id = %conn.id(),
                        origin = %origin,
                        error = %failure,
                        "dropping recipient"
                    );
                    self.metrics.send_failed();
                    conn.close();
                    defunct.push(conn.id().clone());
                }
            }
        }

        report.failed = defunct.len();
        if !defunct.is_empty() {
            let removed = self
                .registry
                .remove_many(defunct.iter())
                .await;
            debug!(origin = %origin, removed, "removed defunct recipients");
        }

        self.metrics.delivered(report.delivered);
        debug!(
            origin = %origin,
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast"
        );
        report
    }
}
