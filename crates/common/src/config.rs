use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Handshake protocol constants
pub mod protocol {
    /// Default port for TCP reverse connections
    pub const DEFAULT_TCP_PORT: u16 = 16004;

    /// Default port for UDP traffic
    pub const DEFAULT_UDP_PORT: u16 = 16005;

    /// Default port for UDP hole punching
    pub const DEFAULT_HOLE_PORT: u16 = 16006;

    /// Responder read/write deadline
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

    /// Upper bound for each leg of a connection attempt
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Keep-alive ping interval
    pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

    /// Keep-alive ticks without any inbound datagram before a UDP peer is
    /// considered gone
    pub const KEEPALIVE_MAX_IDLE_TICKS: u32 = 3;

    /// Maximum frame size (64 KB)
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;

    /// Payload of a successful interaction response
    pub const ACK_PAYLOAD: &[u8] = b"Connected";

    /// Payload of a ping response
    pub const PONG_PAYLOAD: &[u8] = b"PONG";
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LurkerConfig {
    /// Address the listening sockets bind to
    pub listen_addr: String,

    /// TCP listening port, also the local port for reverse dials
    pub tcp_port: u16,

    /// UDP listening port
    pub udp_port: u16,

    /// UDP hole punching port
    pub hole_port: u16,

    /// Responder read/write deadline in milliseconds; 0 means the default
    pub handshake_timeout_ms: u64,

    /// Per-leg connect deadline in milliseconds; 0 means the default
    pub connect_timeout_ms: u64,

    /// Keep-alive interval in milliseconds; 0 means the default
    pub keepalive_interval_ms: u64,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for LurkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            tcp_port: protocol::DEFAULT_TCP_PORT,
            udp_port: protocol::DEFAULT_UDP_PORT,
            hole_port: protocol::DEFAULT_HOLE_PORT,
            handshake_timeout_ms: protocol::HANDSHAKE_TIMEOUT_SECS * 1000,
            connect_timeout_ms: protocol::CONNECT_TIMEOUT_SECS * 1000,
            keepalive_interval_ms: protocol::KEEPALIVE_INTERVAL_SECS * 1000,
            verbose: false,
        }
    }
}

impl LurkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    pub fn with_hole_port(mut self, port: u16) -> Self {
        self.hole_port = port;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = as_millis(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = as_millis(timeout);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval_ms = as_millis(interval);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        millis_or(self.handshake_timeout_ms, protocol::HANDSHAKE_TIMEOUT_SECS)
    }

    pub fn connect_timeout(&self) -> Duration {
        millis_or(self.connect_timeout_ms, protocol::CONNECT_TIMEOUT_SECS)
    }

    pub fn keepalive_interval(&self) -> Duration {
        millis_or(self.keepalive_interval_ms, protocol::KEEPALIVE_INTERVAL_SECS)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Whole milliseconds, rounding a non-zero sub-millisecond duration up
fn as_millis(duration: Duration) -> u64 {
    let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 && !duration.is_zero() {
        1
    } else {
        ms
    }
}

/// A zero value never disables a deadline; it selects the default
fn millis_or(ms: u64, default_secs: u64) -> Duration {
    if ms == 0 {
        Duration::from_secs(default_secs)
    } else {
        Duration::from_millis(ms)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
