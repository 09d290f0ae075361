//! Message fan-out to every registered connection

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{ConnectionId, ConnectionRegistry};
use crate::server::Message;

/// A send failed part way through a broadcast
///
/// Recipients after `failed_id` in id order did not get the message.
#[derive(Debug, Error)]
#[error("send to connection {failed_id} failed after {delivered} deliveries: {source}")]
pub struct BroadcastError {
    pub failed_id: ConnectionId,
    pub delivered: usize,
    #[source]
    pub source: io::Error,
}

/// Re-encodes completed messages and writes them to every connection
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `message` to every registered connection, the sender included
    ///
    /// The message is encoded once and the recipient list is snapshotted
    /// under the registry lock; the writes happen after the lock is
    /// released. A connection deregistered after the snapshot may still get
    /// this message, and one registered after it will not.
    ///
    /// Fails fast: the first send error stops the fan-out.
    pub async fn broadcast(&self, message: &Message) -> Result<usize, BroadcastError> {
        let bytes = message.encode();
        let recipients = self.registry.snapshot().await;

        let mut delivered = 0;
        for handle in &recipients {
            handle
                .send(&bytes)
                .await
                .map_err(|source| BroadcastError {
                    failed_id: handle.id(),
                    delivered,
                    source,
                })?;
            delivered += 1;
        }

        debug!(
            "Broadcast {:?} message ({} bytes) to {} connections",
            message.opcode,
            message.payload.len(),
            delivered
        );
        Ok(delivered)
    }
}
