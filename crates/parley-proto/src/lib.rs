//! Wire primitives for parley rooms.
//! Kept in a dedicated crate so the relay and any alternate client can share the
//! exact envelope and frame definitions without pulling in the WebRTC runtime.

pub mod bulk;
pub mod signal;

pub use bulk::{BulkControl, decode_control, encode_control, total_chunks};
pub use signal::{
    Envelope, IceCandidate, IncomingMessage, MessageType, OutgoingMessage, RoomUser, SdpKind,
    SessionDescription, decode_incoming, encode_outgoing,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("invalid envelope shape: {0}")]
    InvalidEnvelopeShape(&'static str),
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}
