use axum::{
    Json,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

use crate::AppState;
use crate::handler::handle_websocket;
use crate::metrics::HealthStatus;

/// Upgrade to a relayed WebSocket connection
pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        handle_websocket(socket, peer, state).await;
    })
}

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    // Degraded only while the most recent persist attempt is a failure
    let status = if state.metrics.persist_degraded() {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthStatus {
        status: status.to_string(),
        connections: state.registry.len().await as u64,
        uptime_secs: state.metrics.uptime_secs(),
    })
}

/// Metrics endpoint - returns detailed relay metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayConfig;

    async fn health_status(state: &AppState) -> HealthStatus {
        let response = health_handler(State(state.clone())).await.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_recovers_after_successful_persist() {
        let state = AppState::new(RelayConfig::default());
        assert_eq!(health_status(&state).await.status, "healthy");

        state.metrics.persist_error();
        assert_eq!(health_status(&state).await.status, "degraded");

        state.metrics.file_persisted();
        let health = health_status(&state).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.connections, 0);
    }
}
