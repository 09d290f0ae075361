//! WebSocket server implementation
//!
//! Listens for TCP connections, upgrades them, registers each upgraded
//! connection and runs its receive session on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handshake;
use super::upgrade::{write_bad_request, UpgradeRequest};
use crate::config::ServerConfig;
use crate::connection::{ConnectionRegistry, ConnectionSession};

/// How long shutdown waits for sessions to send their close frames
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WebSocket server that broadcasts every message to every client
pub struct WebSocketServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}/", addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    ///
    /// Each connection gets its own task; a failure in one never reaches the
    /// accept loop or the other connections.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let config = Arc::clone(&self.config);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, config, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let live = self.registry.len().await;
        if live > 0 {
            info!("Waiting for {} active connections to close...", live);
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while !self.registry.is_empty().await {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(
                    "{} connections still open after shutdown grace period",
                    self.registry.len().await
                );
            }
        }

        Ok(())
    }
}

/// Upgrade a single connection and run its session
///
/// Anything that fails before registration only affects this connection.
/// Once registered, the connection is always deregistered here on the way
/// out, whatever ended the session.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: Arc<ServerConfig>,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New connection from {}", peer_addr);

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match UpgradeRequest::read_from(&mut reader, config.max_request_bytes).await {
        Ok(request) => request,
        Err(e) => {
            if e.is_rejectable() {
                if let Err(write_err) = write_bad_request(&mut write_half, &e.to_string()).await {
                    debug!("Rejection to {} not sent: {}", peer_addr, write_err);
                }
            }
            return Err(e.into());
        }
    };

    let key = match request.validate(config.require_origin) {
        Ok(key) => key.to_string(),
        Err(e) => {
            warn!("Rejected upgrade from {}: {}", peer_addr, e);
            if let Err(write_err) = write_bad_request(&mut write_half, &e.to_string()).await {
                debug!("Rejection to {} not sent: {}", peer_addr, write_err);
            }
            return Ok(());
        }
    };

    handshake::negotiate(&mut write_half, &key).await?;
    debug!("Handshake complete with {} ({})", peer_addr, request.path);

    let handle = registry.register(write_half, request.headers).await;
    let id = handle.id();
    info!(
        "Connection {} established from {} (origin: {})",
        id,
        peer_addr,
        handle.headers().get("Origin").unwrap_or("-")
    );

    let session = ConnectionSession::new(
        handle,
        reader,
        Arc::clone(&registry),
        config.session_limits(),
        shutdown_rx,
    );
    let result = session.run().await;
    registry.deregister(id).await;

    let end = result?;
    info!("Connection {} from {} ended: {:?}", id, peer_addr, end);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::handshake::compute_accept_key;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(config: ServerConfig) -> (Arc<WebSocketServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(WebSocketServer::new(config));
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Origin", "http://localhost".parse().unwrap());
        let (client, _) = connect_async(request).await.unwrap();
        client
    }

    async fn wait_for_connections(server: &WebSocketServer, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.registry.len().await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    async fn next_message(client: &mut Client) -> WsMessage {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_between_clients() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        wait_for_connections(&server, 2).await;

        alice
            .send(WsMessage::Text("hi bob".into()))
            .await
            .unwrap();

        assert_eq!(next_message(&mut alice).await, WsMessage::Text("hi bob".into()));
        assert_eq!(next_message(&mut bob).await, WsMessage::Text("hi bob".into()));

        bob.send(WsMessage::Binary(vec![0u8, 1, 2, 255]))
            .await
            .unwrap();
        assert_eq!(
            next_message(&mut alice).await,
            WsMessage::Binary(vec![0u8, 1, 2, 255])
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_message_with_16bit_length() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut client = connect(addr).await;
        wait_for_connections(&server, 1).await;

        // 300 bytes needs the 2-byte extended length but still fits one read
        let text = "x".repeat(300);
        client.send(WsMessage::Text(text.clone())).await.unwrap();
        assert_eq!(next_message(&mut client).await, WsMessage::Text(text));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_close_deregisters() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut client = connect(addr).await;
        wait_for_connections(&server, 1).await;

        client.close(None).await.unwrap();
        wait_for_connections(&server, 0).await;

        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejects_missing_origin() {
        let (server, addr) = start_server(ServerConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));
        assert!(response.contains("Origin not provided"));
        assert!(server.registry.is_empty().await);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_raw_handshake_response() {
        let config = ServerConfig::default().with_require_origin(false);
        let (server, addr) = start_server(config).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /chat HTTP/1.1\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let expected = handshake::upgrade_response(&compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="));
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
        wait_for_connections(&server, 1).await;

        // A reserved-bit frame ends the session and the outer handler cleans up
        stream.write_all(&[0xC1, 0x80, 0, 0, 0, 0]).await.unwrap();
        wait_for_connections(&server, 0).await;

        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let mut client = connect(addr).await;
        wait_for_connections(&server, 1).await;

        server.shutdown();
        assert!(matches!(next_message(&mut client).await, WsMessage::Close(_)));
    }
}
