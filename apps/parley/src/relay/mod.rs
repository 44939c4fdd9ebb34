//! Signaling relay clients.

use async_trait::async_trait;
use parley_proto::{OutgoingMessage, ProtocolError};
use thiserror::Error;

pub mod local;
pub mod websocket;

pub use local::{LocalRelay, LocalRelayClient};
pub use websocket::RelayClient;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("relay connection closed")]
    Closed,
}

/// The only view of the relay the mesh needs: deliver one message for a room.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send(&self, room: &str, message: OutgoingMessage) -> Result<(), RelayError>;
}
