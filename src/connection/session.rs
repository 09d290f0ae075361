//! Per-connection receive loop
//!
//! Reads raw blocks off the connection, decodes frames, reassembles
//! fragmented messages and hands completed ones to the [`Broadcaster`].
//! A close frame is echoed back and ends the session.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Broadcaster, ConnectionHandle, ConnectionRegistry};
use crate::server::{decode, encode, Frame, FrameError, Message, Opcode, DEFAULT_MAX_PAYLOAD};

/// Size of a single raw read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Errors that end a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("message of {size} bytes exceeds limit {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer sent a close frame and got the echo
    PeerClosed,
    /// Peer closed the TCP stream without a close frame
    Disconnected,
    /// Server is shutting down
    Shutdown,
    /// Dropped from the registry after a failed send to it
    Evicted,
}

/// Read and size limits for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Bytes requested per read
    pub read_buffer_size: usize,
    /// Upper bound on a reassembled message
    pub max_message_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_PAYLOAD as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Accumulating the fragments of one logical message
    Receiving,
    /// Terminal
    Closed,
}

/// Receive state machine for one connection
///
/// Owns the inbound half of the stream. The outbound half lives in the
/// [`ConnectionHandle`] so broadcasts from other sessions can reach it.
pub struct ConnectionSession<R> {
    handle: ConnectionHandle,
    reader: R,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    limits: SessionLimits,
    shutdown_rx: broadcast::Receiver<()>,
    state: SessionState,
    /// Opcode of the first fragment of the message in progress
    message_opcode: Option<Opcode>,
    accumulator: Vec<u8>,
}

impl<R> ConnectionSession<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        handle: ConnectionHandle,
        reader: R,
        registry: Arc<ConnectionRegistry>,
        limits: SessionLimits,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        Self {
            handle,
            reader,
            registry,
            broadcaster,
            limits,
            shutdown_rx,
            state: SessionState::Receiving,
            message_opcode: None,
            accumulator: Vec::new(),
        }
    }

    /// Run until the peer closes, the stream fails, shutdown is signalled or
    /// the connection is evicted
    ///
    /// Errors leave the connection registered; the caller deregisters it.
    pub async fn run(mut self) -> SessionResult<SessionEnd> {
        let id = self.handle.id();
        let mut buf = vec![0u8; self.limits.read_buffer_size.max(1)];

        while self.state == SessionState::Receiving {
            let read = tokio::select! {
                result = self.reader.read(&mut buf) => Ok(result?),
                _ = self.shutdown_rx.recv() => Err(SessionEnd::Shutdown),
                _ = self.handle.evicted() => Err(SessionEnd::Evicted),
            };

            let n = match read {
                Ok(n) => n,
                Err(SessionEnd::Shutdown) => {
                    info!("Shutdown signal received, closing connection {}", id);
                    if let Err(e) = self.handle.send(&encode(Opcode::Close, &[])).await {
                        debug!("Close frame to connection {} not sent: {}", id, e);
                    }
                    self.state = SessionState::Closed;
                    return Ok(SessionEnd::Shutdown);
                }
                Err(end) => {
                    info!("Connection {} evicted after a failed send", id);
                    self.state = SessionState::Closed;
                    return Ok(end);
                }
            };

            if n == 0 {
                info!("Connection {} closed by peer without close frame", id);
                self.state = SessionState::Closed;
                return Ok(SessionEnd::Disconnected);
            }

            debug!("Connection {} read {} bytes", id, n);
            self.process_block(&buf[..n]).await?;
        }

        Ok(SessionEnd::PeerClosed)
    }

    /// Decode and handle every frame in a raw block
    async fn process_block(&mut self, block: &[u8]) -> SessionResult<()> {
        let mut offset = 0;
        while offset < block.len() && self.state == SessionState::Receiving {
            let (frame, consumed) = decode(&block[offset..], self.limits.max_message_size as u64)?;
            offset += consumed;
            self.handle_frame(frame).await?;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> SessionResult<()> {
        debug!(
            "Connection {} frame: fin={} opcode={:?} masked={} len={}",
            self.handle.id(),
            frame.fin,
            frame.opcode,
            frame.masked,
            frame.payload_length
        );

        if frame.opcode.is_control() {
            return self.close(frame).await;
        }

        let opcode = match (self.message_opcode, frame.opcode) {
            (Some(opcode), _) => opcode,
            (None, Opcode::Continuation) => return Err(SessionError::UnexpectedContinuation),
            (None, opcode) => opcode,
        };

        let size = self.accumulator.len() + frame.payload.len();
        if size > self.limits.max_message_size {
            return Err(SessionError::MessageTooLarge {
                size,
                limit: self.limits.max_message_size,
            });
        }
        self.accumulator.extend_from_slice(&frame.payload);

        if !frame.fin {
            self.message_opcode = Some(opcode);
            return Ok(());
        }

        self.message_opcode = None;
        let message = Message::new(opcode, std::mem::take(&mut self.accumulator));
        self.dispatch(message).await;
        Ok(())
    }

    /// Broadcast a completed message
    ///
    /// A failed recipient is deregistered, its stream shut down and its
    /// session told to stop; this session keeps receiving.
    async fn dispatch(&mut self, message: Message) {
        match self.broadcaster.broadcast(&message).await {
            Ok(delivered) => debug!(
                "Connection {} message delivered to {} connections",
                self.handle.id(),
                delivered
            ),
            Err(e) => {
                warn!(
                    "Broadcast from connection {} aborted: {}",
                    self.handle.id(),
                    e
                );
                if let Some(failed) = self.registry.deregister(e.failed_id).await {
                    failed.evict();
                    if let Err(err) = failed.close().await {
                        debug!("Shutdown of connection {} failed: {}", e.failed_id, err);
                    }
                }
            }
        }
    }

    /// Echo the close frame, shut the stream and deregister
    async fn close(&mut self, frame: Frame) -> SessionResult<()> {
        let id = self.handle.id();
        info!("Connection {} requested close", id);

        self.handle.send(&frame.to_bytes()).await?;
        if let Err(e) = self.handle.close().await {
            debug!("Shutdown of connection {} failed: {}", id, e);
        }
        self.registry.deregister(id).await;
        self.state = SessionState::Closed;
        Ok(())
    }
}
