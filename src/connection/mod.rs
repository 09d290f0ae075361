//! Connection management module
//!
//! Tracks live connections, fans messages out to them, and runs the
//! per-connection receive loop.

mod broadcast;
mod registry;
mod session;

pub use broadcast::*;
pub use registry::*;
pub use session::*;
