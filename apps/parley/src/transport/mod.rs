//! Peer transport bindings.
//!
//! A [`PeerTransport`] is one peer connection: descriptions, candidates, senders and an
//! auxiliary data channel. Callbacks flow back through a single registered
//! [`PeerObserver`]; [`PeerTransport::detach`] unregisters it so nothing fires into a
//! session that is being torn down.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::{IceCandidate, SessionDescription};
use thiserror::Error;

use crate::media::LocalTrack;

pub mod mock;
pub mod webrtc;

/// Label of the bulk-transfer data channel.
pub const AUX_CHANNEL_LABEL: &str = "parley-bulk";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("unknown sender {0}")]
    UnknownSender(SenderId),
    #[error("transport closed")]
    Closed,
    #[error("transport setup failed: {0}")]
    Setup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Handle for one outgoing sender slot on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// An inbound media track as announced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Human readable label; bindings without one synthesize it from stream and track ids.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability set every binding reports through.
pub trait PeerObserver: Send + Sync {
    fn on_track(&self, track: RemoteTrack);
    fn on_ice_candidate(&self, candidate: IceCandidate);
    fn on_connection_state_change(&self, state: ConnectionState);
    fn on_data_channel(&self, channel: Arc<dyn AuxChannel>);
    fn on_negotiation_needed(&self);
}

pub trait ChannelObserver: Send + Sync {
    fn on_open(&self);
    fn on_close(&self);
    fn on_message(&self, message: ChannelMessage);
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    /// Accepts offers, answers and rollbacks.
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    /// Fails when no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError>;
    /// Swaps the track on an existing sender without renegotiating.
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), TransportError>;
    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError>;

    /// Ordered, reliable channel. The remote side receives it through `on_data_channel`.
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn AuxChannel>, TransportError>;

    fn set_observer(&self, observer: Arc<dyn PeerObserver>);
    /// Unregisters the observer; later callbacks are dropped.
    fn detach(&self);
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait AuxChannel: Send + Sync {
    fn label(&self) -> String;
    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    async fn buffered_amount(&self) -> usize;
    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
    /// Resolves once the buffered amount is at or below the low threshold.
    async fn buffered_amount_low(&self);

    fn set_observer(&self, observer: Arc<dyn ChannelObserver>);
    fn detach(&self);
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local_id: &str,
        peer_id: &str,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
