//! Configuration module
//!
//! Handles loading server settings from an optional TOML file.

mod server;

pub use server::*;
