//! HTTP upgrade request
//!
//! Reads the request head that precedes the handshake and checks the
//! headers a WebSocket upgrade requires. Nothing here writes to the
//! connection except [`write_bad_request`] when validation fails.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The only protocol version the hub speaks
pub const SUPPORTED_VERSION: &str = "13";

/// Default cap on the size of the request head (8 KiB)
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Errors that can occur while reading or validating an upgrade request
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("failed to read upgrade request: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before the request was complete")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid method {0}, must be GET")]
    InvalidMethod(String),

    #[error("invalid Upgrade header, must be 'websocket'")]
    InvalidUpgrade,

    #[error("invalid Connection header, must contain 'Upgrade'")]
    InvalidConnection,

    #[error("Sec-WebSocket-Key not provided")]
    MissingKey,

    #[error("Origin not provided")]
    MissingOrigin,

    #[error("unsupported Sec-WebSocket-Version {0:?}, must be {SUPPORTED_VERSION}")]
    UnsupportedVersion(Option<String>),
}

impl UpgradeError {
    /// Whether the peer is still there to receive a `400 Bad Request`
    pub fn is_rejectable(&self) -> bool {
        !matches!(self, UpgradeError::Io(_) | UpgradeError::Closed)
    }
}

/// Headers captured from the upgrade request, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeHeaders {
    entries: Vec<(String, String)>,
}

impl HandshakeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed upgrade request head
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: HandshakeHeaders,
}

impl UpgradeRequest {
    /// Read the request line and headers up to the blank line
    ///
    /// Only the head is consumed; any bytes after it stay in `reader`. At
    /// most `max_bytes` are read, even when no line break ever arrives.
    pub async fn read_from<R>(reader: &mut R, max_bytes: usize) -> Result<Self, UpgradeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut head = String::new();
        loop {
            let remaining = max_bytes.saturating_sub(head.len());
            if remaining == 0 {
                return Err(UpgradeError::TooLarge(max_bytes));
            }

            let mut line = String::new();
            let n = (&mut *reader)
                .take(remaining as u64)
                .read_line(&mut line)
                .await?;
            if !line.ends_with('\n') {
                return Err(if n == remaining {
                    UpgradeError::TooLarge(max_bytes)
                } else {
                    UpgradeError::Closed
                });
            }

            head.push_str(&line);
            if line == "\r\n" || line == "\n" {
                break;
            }
        }
        Self::parse(&head)
    }

    /// Parse a request head
    pub fn parse(head: &str) -> Result<Self, UpgradeError> {
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| UpgradeError::Malformed("empty request".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| UpgradeError::Malformed("missing method".to_string()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| UpgradeError::Malformed("missing path".to_string()))?
            .to_string();

        let mut headers = HandshakeHeaders::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| UpgradeError::Malformed(format!("bad header line: {line}")))?;
            headers.insert(name.trim(), value.trim());
        }

        Ok(Self {
            method,
            path,
            headers,
        })
    }

    /// Check the upgrade headers and return the client key
    pub fn validate(&self, require_origin: bool) -> Result<&str, UpgradeError> {
        if self.method != "GET" {
            return Err(UpgradeError::InvalidMethod(self.method.clone()));
        }

        match self.headers.get("Upgrade") {
            Some(v) if v.eq_ignore_ascii_case("websocket") => {}
            _ => return Err(UpgradeError::InvalidUpgrade),
        }

        match self.headers.get("Connection") {
            Some(v)
                if v
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade")) => {}
            _ => return Err(UpgradeError::InvalidConnection),
        }

        let key = match self.headers.get("Sec-WebSocket-Key") {
            Some(k) if !k.is_empty() => k,
            _ => return Err(UpgradeError::MissingKey),
        };

        if require_origin && self.headers.get("Origin").map_or(true, str::is_empty) {
            return Err(UpgradeError::MissingOrigin);
        }

        match self.headers.get("Sec-WebSocket-Version") {
            Some(SUPPORTED_VERSION) => {}
            other => return Err(UpgradeError::UnsupportedVersion(other.map(String::from))),
        }

        Ok(key)
    }
}

/// Reject an upgrade with a plain-text `400 Bad Request`
pub async fn write_bad_request<W>(writer: &mut W, reason: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("Bad Request: {}", reason);
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Sec-WebSocket-Version: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        SUPPORTED_VERSION,
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
