//! Server configuration
//!
//! Loads listener and connection limits from a TOML file. Every key is
//! optional; missing keys fall back to the defaults below.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::connection::{SessionLimits, DEFAULT_READ_BUFFER_SIZE};
use crate::server::{DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_REQUEST_BYTES};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "socket-hub.toml";

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
    /// Largest reassembled message accepted from a client
    pub max_message_size: usize,
    /// Largest upgrade request head accepted
    pub max_request_bytes: usize,
    /// Reject upgrades without an `Origin` header
    pub require_origin: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_PAYLOAD as usize,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            require_origin: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, using defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Check limits that would make the server unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_message_size must be greater than 0".to_string(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_request_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_require_origin(mut self, require_origin: bool) -> Self {
        self.require_origin = require_origin;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Per-connection limits derived from this configuration
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            read_buffer_size: self.read_buffer_size,
            max_message_size: self.max_message_size,
        }
    }
}
