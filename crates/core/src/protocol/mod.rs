/// Handshake wire protocol
///
/// Every frame is a JSON envelope whose kind selects the responder action.
/// Interaction envelopes embed a `HandshakeRequest`; the responder answers
/// with a `HandshakeResponse`.

mod handshake;

pub use handshake::{
    HandshakeEnvelope, HandshakeKind, HandshakeRequest, HandshakeResponse, HandshakeStatus,
};
