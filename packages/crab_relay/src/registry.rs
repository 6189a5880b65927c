//! The set of live connections.
//!
//! Membership changes and snapshot reads are serialized through one mutex.
//! Nothing holds that lock while talking to a connection: broadcasters take a
//! snapshot and release it before sending.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateId(ConnectionId),
}

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<BTreeMap<ConnectionId, Arc<Connection>>>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id for a connection accepted from `peer`.
    pub fn next_id(&self, peer: SocketAddr) -> ConnectionId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionId::new(peer, seq)
    }

    pub async fn add(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let mut conns = self.connections.lock().await;
        match conns.entry(conn.id().clone()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateId(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(conn);
                Ok(())
            }
        }
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        self.connections.lock().await.remove(id).is_some()
    }

    /// Remove several connections under one lock. Returns how many were present.
    pub async fn remove_many<'a>(&self, ids: impl IntoIterator<Item = &'a ConnectionId>) -> usize {
        let mut conns = self.connections.lock().await;
        ids.into_iter()
            .filter(|id| conns.remove(*id).is_some())
            .count()
    }

    /// Everyone except `origin`, in accept order.
    pub async fn snapshot_excluding(&self, origin: &ConnectionId) -> Vec<Arc<Connection>> {
        let conns = self.connections.lock().await;
        conns
            .iter()
            .filter(|(id, _)| *id != origin)
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Ask every registered connection to close. Entries leave the registry
    /// as their handlers finish cleanup.
    pub async fn close_all(&self) -> usize {
        let conns: Vec<Arc<Connection>> = self.connections.lock().await.values().cloned().collect();
        for conn in &conns {
            conn.close();
        }
        debug!(count = conns.len(), "closing all connections");
        conns.len()
    }
}
