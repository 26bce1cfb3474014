use thiserror::Error;

/// Common error types for Lurker
#[derive(Debug, Error)]
pub enum LurkerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed service descriptor: {0}")]
    MalformedService(String),

    #[error("Malformed handshake frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Handshake rejected with status {status}")]
    HandshakeRejected { status: String },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Transport closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for Lurker operations
pub type Result<T> = std::result::Result<T, LurkerError>;

impl LurkerError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed_service(msg: impl Into<String>) -> Self {
        Self::MalformedService(msg.into())
    }

    pub fn malformed_frame(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Whether the error came from a deadline expiring
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

