//! Per-connection lifecycle: register, receive loop, cleanup.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::connection::{Connection, Outbound, run_writer};
use crate::framing::{Assembled, FileTransfer, Frame, FrameProtocol};

/// Why a receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Client sent a close frame.
    PeerClosed,
    /// Stream ended without a close frame.
    Disconnected,
    /// Reading from the socket failed.
    TransportError(String),
    /// The connection was closed from our side (dropped recipient or shutdown).
    Closed,
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::PeerClosed => write!(f, "peer closed"),
            Exit::Disconnected => write!(f, "disconnected"),
            Exit::TransportError(e) => write!(f, "transport error: {}", e),
            Exit::Closed => write!(f, "closed by server"),
        }
    }
}

/// Serve an upgraded WebSocket until it goes away.
pub async fn handle_websocket(socket: WebSocket, peer: SocketAddr, state: AppState) -> Exit {
    let (sender, receiver) = socket.split();
    serve_connection(sender, receiver, peer, state).await
}

/// Run one connection over any split message transport.
///
/// Cleanup (stop reading, deregister, release the socket) runs exactly once on
/// every exit path.
pub async fn serve_connection<Si, St, E>(sink: Si, stream: St, peer: SocketAddr, state: AppState) -> Exit
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: fmt::Display,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let id = state.registry.next_id(peer);
    let (tx, rx) = mpsc::channel(state.config.outbound_queue_capacity);
    let conn = Arc::new(Connection::new(id.clone(), tx, state.shutdown_token.child_token()));

    if let Err(e) = state.registry.add(conn.clone()).await {
        error!(conn_id = %id, error = %e, "failed to register connection");
        return Exit::Closed;
    }
    state.metrics.connection_opened();
    info!(conn_id = %id, "client connected");

    let writer = tokio::spawn(run_writer(
        sink,
        rx,
        conn.clone(),
        state.config.relay_chunk_bytes,
    ));

    let mut protocol = FrameProtocol::new(state.config.max_file_bytes);
    // Takes the stream by value: reading stops when this returns.
    let exit = receive_loop(stream, &conn, &mut protocol, &state).await;

    if let Some(interrupted) = protocol.finish() {
        warn!(conn_id = %id, error = %interrupted, "discarding partial transfer");
        state.metrics.transfer_interrupted();
    }

    if state.registry.remove(&id).await {
        debug!(conn_id = %id, "deregistered");
    }
    conn.close();
    if let Err(e) = writer.await {
        warn!(conn_id = %id, error = %e, "writer task failed");
    }
    conn.mark_closed();
    state.metrics.connection_closed();

    info!(conn_id = %id, reason = %exit, "client disconnected");
    exit
}

async fn receive_loop<St, E>(
    mut stream: St,
    conn: &Connection,
    protocol: &mut FrameProtocol,
    state: &AppState,
) -> Exit
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = tokio::select! {
            _ = conn.closed() => return Exit::Closed,
            next = stream.next() => next,
        };

        let frame = match next {
            None => return Exit::Disconnected,
            Some(Err(e)) => return Exit::TransportError(e.to_string()),
            Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
            Some(Ok(Message::Close(_))) => return Exit::PeerClosed,
            // Ping/pong are answered by the transport
            Some(Ok(_)) => continue,
        };
        state.metrics.frame_received();

        match protocol.feed(frame) {
            Ok(None) => {}
            Ok(Some(Assembled::Text(payload))) => {
                state.metrics.text_relayed();
                state
                    .router
                    .broadcast(Outbound::text(payload), conn.id())
                    .await;
            }
            Ok(Some(Assembled::File(file))) => deliver_file(state, conn, file).await,
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "protocol error");
                state.metrics.protocol_error();
            }
        }
    }
}

/// Persist and/or relay a completed transfer. Failures stay local.
async fn deliver_file(state: &AppState, origin: &Connection, file: FileTransfer) {
    info!(
        conn_id = %origin.id(),
        file_name = %file.file_name,
        bytes = file.body.len(),
        "file transfer complete"
    );
    state.metrics.file_completed();

    let mut stored = false;
    if let Some(store) = &state.store {
        match store.store(&file.file_name, &file.body).await {
            Ok(path) => {
                info!(conn_id = %origin.id(), path = %path.display(), "file persisted");
                state.metrics.file_persisted();
                stored = true;
            }
            Err(e) => {
                warn!(conn_id = %origin.id(), error = %e, "failed to persist file");
                state.metrics.persist_error();
            }
        }
    }

    let announcement = format!("Received file: {}", file.file_name);
    if state.config.relay_files {
        state
            .router
            .broadcast(Outbound::File(Arc::new(file)), origin.id())
            .await;
    }
    if stored && state.config.announce_files {
        state
            .router
            .broadcast(Outbound::text(announcement), origin.id())
            .await;
    }
}
