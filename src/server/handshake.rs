//! Upgrade handshake response
//!
//! Derives the `Sec-WebSocket-Accept` token from the client's key and writes
//! the `101 Switching Protocols` response. This is the only write the
//! connection sees before frames start flowing.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// GUID appended to the client key before hashing (RFC 6455 section 1.3)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Errors that can occur while negotiating the upgrade
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing or empty Sec-WebSocket-Key")]
    MissingKey,

    #[error("failed to write handshake response: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute `base64(sha1(key + GUID))`
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Render the full `101 Switching Protocols` response
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    )
}

/// Write the upgrade response for `client_key` and flush it
///
/// Returns the accept token that was sent. On error the caller must not
/// register the connection.
pub async fn negotiate<W>(writer: &mut W, client_key: &str) -> Result<String, HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let client_key = client_key.trim();
    if client_key.is_empty() {
        return Err(HandshakeError::MissingKey);
    }

    let accept = compute_accept_key(client_key);
    writer
        .write_all(upgrade_response(&accept).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(accept)
}
