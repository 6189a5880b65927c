//! One relayed client: identity, lifecycle state and its outbound queue.
//!
//! Every write to a client's socket goes through its bounded queue, drained by
//! exactly one writer task ([`run_writer`]). A relayed file is a single queue
//! item, so its header and body units always reach the socket back to back.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::framing::FileTransfer;

/// Opaque connection identity: peer address plus accept sequence number.
///
/// Ordered by sequence, so registry snapshots come out in accept order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    seq: u64,
    label: Arc<str>,
}

impl ConnectionId {
    pub fn new(peer: SocketAddr, seq: u64) -> Self {
        Self {
            seq,
            label: format!("{peer}#{seq}").into(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn as_str(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One item of a connection's send queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Arc<str>),
    /// Written as the header text unit followed by the body in binary units.
    File(Arc<FileTransfer>),
}

impl Outbound {
    pub fn text(payload: impl Into<Arc<str>>) -> Self {
        Self::Text(payload.into())
    }
}

/// Why a send to one recipient did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// A registered client as seen by the registry and the router.
///
/// The socket itself is owned by the connection's handler and writer task;
/// everyone else can only enqueue, close, or identify.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Enqueue without waiting. A full queue fails instead of stalling the caller.
    pub fn send(&self, item: Outbound) -> Result<(), SendFailure> {
        if !self.is_open() {
            return Err(SendFailure::Closed);
        }
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::QueueFull,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Move to `Closing` and tell the owning handler to stop. Idempotent.
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.cancel.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called or the server shuts down.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Drain a connection's queue into its socket until the queue ends or the
/// connection is closed.
///
/// Close is only observed between queue items, never in the middle of a file.
pub async fn run_writer<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Outbound>,
    conn: Arc<Connection>,
    chunk_bytes: usize,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = conn.closed() => break,
            item = queue.recv() => item,
        };
        let Some(item) = item else { break };

        if let Err(e) = write_outbound(&mut sink, item, chunk_bytes).await {
            warn!(conn_id = %conn.id(), error = %e, "write failed, closing connection");
            conn.close();
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(conn_id = %conn.id(), error = %e, "socket close failed");
    }
}

async fn write_outbound<S>(sink: &mut S, item: Outbound, chunk_bytes: usize) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    match item {
        Outbound::Text(text) => sink.send(Message::Text(text.to_string().into())).await,
        Outbound::File(file) => {
            sink.feed(Message::Text(file.header_text().into()))
                .await?;
            let chunk_bytes = chunk_bytes.max(1);
            let mut offset = 0;
            while offset < file.body.len() {
                let end = (offset + chunk_bytes).min(file.body.len());
                sink.feed(Message::Binary(file.body.slice(offset..end)))
                    .await?;
                offset = end;
            }
            sink.flush().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;

    fn test_id(seq: u64) -> ConnectionId {
        ConnectionId::new(([127, 0, 0, 1], 4000).into(), seq)
    }

    fn make_connection(capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new(test_id(1), tx, CancellationToken::new());
        (Arc::new(conn), rx)
    }

    fn file(name: &str, body: &'static [u8]) -> Arc<FileTransfer> {
        Arc::new(FileTransfer::new(name, Bytes::from_static(body)))
    }

    #[test]
    fn id_renders_peer_and_sequence() {
        let id = test_id(7);
        assert_eq!(id.as_str(), "127.0.0.1:4000#7");
        assert_eq!(id.to_string(), "127.0.0.1:4000#7");
        assert_eq!(id.seq(), 7);
        assert!(test_id(2) < test_id(10));
    }

    #[tokio::test]
    async fn send_enqueues_while_open() {
        let (conn, mut rx) = make_connection(4);
        conn.send(Outbound::text("hi")).unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Text(t) => assert_eq!(&*t, "hi"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_fails_without_blocking() {
        let (conn, _rx) = make_connection(1);
        conn.send(Outbound::text("one")).unwrap();
        assert_eq!(conn.send(Outbound::text("two")), Err(SendFailure::QueueFull));
    }

    #[tokio::test]
    async fn dropped_queue_reports_closed() {
        let (conn, rx) = make_connection(1);
        drop(rx);
        assert_eq!(conn.send(Outbound::text("x")), Err(SendFailure::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_sends() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.state(), ConnectionState::Open);
        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(conn.send(Outbound::text("late")), Err(SendFailure::Closed));
        // closed() resolves immediately once cancelled
        conn.closed().await;
        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn writer_emits_header_then_chunked_body() {
        let (conn, rx) = make_connection(4);
        let (sink, mut out) = fmpsc::unbounded::<Message>();
        conn.send(Outbound::File(file("r.txt", b"abcdefg"))).unwrap();
        conn.send(Outbound::text("after")).unwrap();

        let writer = tokio::spawn(run_writer(sink, rx, conn.clone(), 3));

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(out.next().await.unwrap());
        }
        assert_eq!(seen[0], Message::Text("#file|r.txt|7".into()));
        assert_eq!(seen[1], Message::Binary(Bytes::from_static(b"abc")));
        assert_eq!(seen[2], Message::Binary(Bytes::from_static(b"def")));
        assert_eq!(seen[3], Message::Binary(Bytes::from_static(b"g")));
        assert_eq!(seen[4], Message::Text("after".into()));

        conn.close();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn writer_sends_empty_file_as_header_only() {
        let (conn, rx) = make_connection(4);
        let (sink, mut out) = fmpsc::unbounded::<Message>();
        conn.send(Outbound::File(file("empty", b""))).unwrap();
        conn.send(Outbound::text("next")).unwrap();

        let writer = tokio::spawn(run_writer(sink, rx, conn.clone(), 1024));
        assert_eq!(out.next().await.unwrap(), Message::Text("#file|empty|0".into()));
        assert_eq!(out.next().await.unwrap(), Message::Text("next".into()));

        conn.close();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn writer_closes_connection_when_socket_fails() {
        let (conn, rx) = make_connection(4);
        let (sink, out) = fmpsc::unbounded::<Message>();
        drop(out);
        conn.send(Outbound::text("lost")).unwrap();

        run_writer(sink, rx, conn.clone(), 1024).await;
        assert_eq!(conn.state(), ConnectionState::Closing);
    }
}
