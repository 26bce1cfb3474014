use lurker_common::protocol::{ACK_PAYLOAD, PONG_PAYLOAD};
use lurker_common::types::base64_bytes;
use lurker_common::{LurkerError, Result, Service};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Action an inbound envelope asks the responder to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    /// Request/response handshake carrying a service descriptor
    Interaction,

    /// Liveness check, answered with a pong
    Ping,

    /// Relay assistance, reserved
    Intermediary,

    Other,
}

impl HandshakeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interaction => "interaction",
            Self::Ping => "ping",
            Self::Intermediary => "intermediary",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for HandshakeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic frame every handshake message travels in.
///
/// The payload is left undecoded so that a malformed envelope and a
/// malformed embedded service are reported separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    pub kind: HandshakeKind,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl HandshakeEnvelope {
    pub fn new(kind: HandshakeKind) -> Self {
        Self {
            kind,
            payload: serde_json::Value::Null,
        }
    }

    /// Wrap a handshake request
    pub fn interaction(request: &HandshakeRequest) -> Result<Self> {
        let payload = serde_json::to_value(request)
            .map_err(|e| LurkerError::malformed_service(e.to_string()))?;

        Ok(Self {
            kind: HandshakeKind::Interaction,
            payload,
        })
    }

    pub fn ping() -> Self {
        Self::new(HandshakeKind::Ping)
    }

    /// Decode the embedded handshake request
    pub fn request(&self) -> Result<HandshakeRequest> {
        HandshakeRequest::deserialize(&self.payload)
            .map_err(|e| LurkerError::malformed_service(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LurkerError::malformed_frame(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| LurkerError::malformed_frame(e.to_string()))
    }
}

/// Request sent by the initiating side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub service: Service,

    /// Keep the connection open with periodic pings after the handshake
    #[serde(default)]
    pub keep_connect: bool,
}

impl HandshakeRequest {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            keep_connect: false,
        }
    }

    pub fn with_keep_connect(mut self, keep_connect: bool) -> Self {
        self.keep_connect = keep_connect;
        self
    }
}

/// Response status. Only `Success` marks a usable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum HandshakeStatus {
    Success,
    Failed,
    Unknown(u8),
}

impl Default for HandshakeStatus {
    fn default() -> Self {
        Self::Failed
    }
}

impl From<u8> for HandshakeStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Failed,
            other => Self::Unknown(other),
        }
    }
}

impl From<HandshakeStatus> for u8 {
    fn from(status: HandshakeStatus) -> Self {
        match status {
            HandshakeStatus::Success => 0,
            HandshakeStatus::Failed => 1,
            HandshakeStatus::Unknown(code) => code,
        }
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
            Self::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// Response written by the responder
///
/// Unknown fields are rejected so that an envelope is never read as a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub status: HandshakeStatus,

    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl HandshakeResponse {
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Self {
            status: HandshakeStatus::Success,
            data: data.into(),
        }
    }

    /// Acknowledgment of a completed interaction
    pub fn connected() -> Self {
        Self::success(ACK_PAYLOAD)
    }

    pub fn pong() -> Self {
        Self::success(PONG_PAYLOAD)
    }

    pub fn is_success(&self) -> bool {
        self.status == HandshakeStatus::Success
    }

    /// Turn a non-success status into an error
    pub fn ensure_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(LurkerError::HandshakeRejected {
                status: self.status.to_string(),
            })
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| LurkerError::malformed_frame(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| LurkerError::malformed_frame(e.to_string()))
    }
}
