//! WebSocket server module
//!
//! Accepts TCP connections, performs the upgrade handshake, and speaks the
//! frame protocol on upgraded connections.

mod handshake;
mod protocol;
mod upgrade;
mod websocket;

pub use protocol::*;
pub use upgrade::*;
pub use websocket::*;
