//! Registry of live connections
//!
//! Maintains the id counter and the id → handle map behind a single lock.
//! The lock is only held to mutate or copy the map; callers do their
//! network I/O on handles they got out of [`ConnectionRegistry::snapshot`].

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::server::HandshakeHeaders;

/// Identifier assigned to a connection at registration
pub type ConnectionId = u64;

/// Type-erased outbound half of a connection's byte stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to a registered connection
///
/// Cloning is cheap; all clones write through the same outbound stream, and
/// a per-connection lock keeps concurrent frames from interleaving.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    headers: Arc<HandshakeHeaders>,
    writer: Arc<Mutex<BoxedWriter>>,
    evicted: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Headers of the upgrade request that created this connection
    pub fn headers(&self) -> &HandshakeHeaders {
        &self.headers
    }

    /// Write `bytes` and flush
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shut down the outbound stream
    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    /// Tell the connection's session to stop reading
    pub fn evict(&self) {
        self.evicted.send_replace(true);
    }

    /// Resolves once [`evict`](Self::evict) has been called on any clone
    pub async fn evicted(&self) {
        let mut rx = self.evicted.subscribe();
        // The sender lives as long as `self`, so this only returns once set
        let _ = rx.wait_for(|evicted| *evicted).await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("headers", &self.headers)
            .field("evicted", &*self.evicted.borrow())
            .finish()
    }
}

struct RegistryState {
    next_id: ConnectionId,
    connections: BTreeMap<ConnectionId, ConnectionHandle>,
}

/// Thread-safe registry of live connections
///
/// Ids come from a counter that is never decremented, so an id is never
/// handed out twice for the lifetime of the registry.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 0,
                connections: BTreeMap::new(),
            }),
        }
    }

    /// Assign the next id to a handshaken connection and insert it
    pub async fn register<W>(&self, writer: W, headers: HandshakeHeaders) -> ConnectionHandle
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;

        let handle = ConnectionHandle {
            id,
            headers: Arc::new(headers),
            writer: Arc::new(Mutex::new(Box::new(writer))),
            evicted: Arc::new(watch::channel(false).0),
        };
        state.connections.insert(id, handle.clone());
        debug!(
            "Registered connection {} ({} live)",
            id,
            state.connections.len()
        );
        handle
    }

    /// Remove a connection; removing an unknown id is a no-op
    pub async fn deregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut state = self.state.lock().await;
        let removed = state.connections.remove(&id);
        if removed.is_some() {
            debug!(
                "Deregistered connection {} ({} live)",
                id,
                state.connections.len()
            );
        }
        removed
    }

    /// Copy of every registered handle, in ascending id order
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.state
            .lock()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.state.lock().await.connections.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
