// Library interface for crab_relay
// Exposes the relay core and an axum router that can be served or mounted elsewhere

pub mod config;
pub mod connection;
pub mod framing;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod router;

pub use config::{FileConfig, RelayConfig};
pub use connection::{Connection, ConnectionId, ConnectionState, Outbound, SendFailure};
pub use framing::{FileTransfer, Frame, FrameProtocol, ProtocolError, TransferInterrupted};
pub use metrics::RelayMetrics;
pub use persistence::FileStore;
pub use registry::ConnectionRegistry;
pub use router::{BroadcastReport, BroadcastRouter};

use axum::{Router, routing::get};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: BroadcastRouter,
    pub config: Arc<RelayConfig>,
    /// Present when persistence is configured
    pub store: Option<Arc<FileStore>>,
    pub metrics: Arc<RelayMetrics>,
    /// Parent of every connection's close token
    pub shutdown_token: CancellationToken,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(RelayMetrics::new());
        let router = BroadcastRouter::new(registry.clone(), metrics.clone());
        let store = config
            .persist_dir
            .as_ref()
            .map(|dir| Arc::new(FileStore::new(dir)));

        Self {
            registry,
            router,
            config: Arc::new(config),
            store,
            metrics,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Move every live connection to closing and stop their handlers.
    pub async fn shutdown(&self) {
        let count = self.registry.close_all().await;
        self.shutdown_token.cancel();
        info!("Closed {} connections", count);
    }
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
pub struct RequestIdMakeSpan;

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

/// Build the HTTP surface: `/ws` plus health and metrics.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// WebSocket route reads the peer address from it.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(http::websocket_handler))
        .route("/health", get(http::health_handler))
        .route("/health/live", get(http::health_live_handler))
        .route("/metrics", get(http::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
