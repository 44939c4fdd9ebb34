//! Per-room mesh of peer connections.
//!
//! [`MeshSession`] is built once per room join and owns everything tied to that
//! membership: the peer registry, local media, the room key and inbound transfers.
//! Relay envelopes go in through [`MeshSession::handle_envelope`]; everything
//! observable comes out as [`MeshEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use parley_proto::{Envelope, IncomingMessage, OutgoingMessage};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::crypto::{ChatBody, CryptoError, KeyCache};
use crate::media::{
    DisplayCapture, LocalPreviews, LocalTrack, MediaDevices, MediaError, StreamClass,
    TrackChange, TrackClassifier, TrackManager, TrackSlot,
};
use crate::relay::{RelayError, SignalSink};
use crate::transfer::{
    self, BulkPayload, BulkReceiver, BulkSender, BulkTarget, CompletedTransfer,
    TransferError, TransferProgress,
};
use crate::transport::{ConnectionState, RemoteTrack, TransportFactory};

pub mod negotiation;
pub mod registry;
pub mod session;

pub use negotiation::{NegotiationError, Politeness, SignalingPhase};
pub use registry::{PeerRegistry, ReconcileReport, RegistryError};
pub use session::{InboundSignal, PeerNotice, PeerSession, PeerSnapshot, SessionContext};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Inbound chat as it should be shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatContent {
    Decrypted(String),
    /// Sender did not encrypt.
    Plaintext(String),
    /// Placeholder text for a message that failed to decrypt.
    Undecryptable(String),
}

impl ChatContent {
    pub fn text(&self) -> &str {
        match self {
            ChatContent::Decrypted(text)
            | ChatContent::Plaintext(text)
            | ChatContent::Undecryptable(text) => text,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerAdded {
        peer_id: String,
    },
    PeerRemoved {
        peer_id: String,
    },
    ConnectionStateChanged {
        peer_id: String,
        state: ConnectionState,
    },
    RemoteTrackAdded {
        peer_id: String,
        track: RemoteTrack,
        class: StreamClass,
    },
    AuxChannelChanged {
        peer_id: String,
        open: bool,
    },
    ChatReceived {
        from: String,
        content: ChatContent,
    },
    TypingChanged {
        from: String,
        typing: bool,
    },
    RoomIdGenerated {
        room_id: Option<String>,
    },
    RelayError {
        error: String,
    },
    TransferCompleted(CompletedTransfer),
}

/// Collaborators a mesh session is built from.
#[derive(Clone)]
pub struct MeshDeps {
    pub transports: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub signals: Arc<dyn SignalSink>,
    pub classifier: Arc<dyn TrackClassifier>,
}

pub struct MeshSession {
    local_id: String,
    room_id: String,
    config: MeshConfig,
    signals: Arc<dyn SignalSink>,
    registry: Arc<PeerRegistry>,
    tracks: Arc<TrackManager>,
    keys: KeyCache,
    bulk: BulkSender,
    progress: watch::Receiver<BTreeMap<(String, String), TransferProgress>>,
    events: broadcast::Sender<MeshEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl MeshSession {
    /// Must be called inside a tokio runtime; spawns the notice task.
    pub fn new(
        local_id: &str,
        room_id: &str,
        passphrase: Option<&str>,
        config: MeshConfig,
        deps: MeshDeps,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let tracks = Arc::new(TrackManager::new(deps.devices, cancel.child_token()));
        let ctx = SessionContext {
            local_id: local_id.to_string(),
            room_id: room_id.to_string(),
            signals: Arc::clone(&deps.signals),
            classifier: deps.classifier,
            notices: notices_tx,
            buffered_low_water: config.buffered_low_water,
        };
        let registry = Arc::new(PeerRegistry::new(
            ctx,
            config.max_peers,
            config.reconcile_debounce,
            deps.transports,
            Arc::clone(&tracks),
            cancel.child_token(),
        ));
        let receiver = BulkReceiver::new(config.max_bulk_bytes);
        let progress = receiver.subscribe();
        let notice_task = tokio::spawn(forward_notices(
            notices_rx,
            receiver,
            events.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            local_id: local_id.to_string(),
            room_id: room_id.to_string(),
            keys: KeyCache::new(room_id, passphrase, config.kdf_iterations),
            config,
            signals: deps.signals,
            registry,
            tracks,
            bulk: BulkSender::new(),
            progress,
            events,
            tasks: Mutex::new(vec![notice_task]),
            cancel,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn transfer_progress(
        &self,
    ) -> watch::Receiver<BTreeMap<(String, String), TransferProgress>> {
        self.progress.clone()
    }

    pub fn local_previews(&self) -> watch::Receiver<LocalPreviews> {
        self.tracks.previews()
    }

    pub fn peer(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.registry.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub async fn peer_snapshot(&self) -> Vec<PeerSnapshot> {
        let mut snapshots = Vec::new();
        for session in self.registry.sessions() {
            snapshots.push(session.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    pub async fn join(&self) -> Result<(), MeshError> {
        info!(target: "parley::mesh", room_id = %self.room_id, "joining room");
        self.signals
            .send(&self.room_id, OutgoingMessage::JoinRoom)
            .await?;
        Ok(())
    }

    /// Announces departure, then tears the mesh down.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let sent = self
            .signals
            .send(&self.room_id, OutgoingMessage::LeaveRoom)
            .await;
        self.shutdown().await;
        sent?;
        Ok(())
    }

    /// Applies envelopes until the relay stream ends or the mesh shuts down.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
            }
        }
        debug!(target: "parley::mesh", room_id = %self.room_id, "relay stream finished");
    }

    pub async fn handle_envelope(&self, envelope: Envelope) {
        let Envelope {
            room,
            from,
            message,
        } = envelope;
        if room.as_deref().is_some_and(|room| room != self.room_id) {
            debug!(
                target: "parley::mesh",
                room = ?room,
                kind = %message.message_type(),
                "dropping envelope for another room"
            );
            return;
        }
        match message {
            IncomingMessage::RoomUsers { users } => {
                debug!(target: "parley::mesh", members = users.len(), "membership snapshot");
                self.registry
                    .update_membership(users.into_iter().map(|user| user.user_id));
            }
            IncomingMessage::Joined => {
                debug!(target: "parley::mesh", from = ?from, "peer joined");
            }
            IncomingMessage::Left => {
                debug!(target: "parley::mesh", from = ?from, "peer left");
            }
            IncomingMessage::ChatMessage { message } => {
                let Some(from) = from.filter(|from| *from != self.local_id) else {
                    return;
                };
                let content = self.open_chat(&message, &from).await;
                self.emit(MeshEvent::ChatReceived { from, content });
            }
            IncomingMessage::Typing { typing } => {
                if let Some(from) = from.filter(|from| *from != self.local_id) {
                    self.emit(MeshEvent::TypingChanged { from, typing });
                }
            }
            IncomingMessage::RoomIdGenerated { room_id } => {
                self.emit(MeshEvent::RoomIdGenerated { room_id });
            }
            IncomingMessage::Error { error } => {
                warn!(target: "parley::relay", error = %error, "relay reported error");
                self.emit(MeshEvent::RelayError { error });
            }
            IncomingMessage::Offer { sdp, to } => {
                self.route_signal(from, &to, InboundSignal::Offer(sdp)).await;
            }
            IncomingMessage::Answer { sdp, to } => {
                self.route_signal(from, &to, InboundSignal::Answer(sdp)).await;
            }
            IncomingMessage::IceCandidate { candidate, to } => {
                self.route_signal(from, &to, InboundSignal::Candidate(candidate))
                    .await;
            }
        }
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), MeshError> {
        let sealed = self.keys.seal(text, &self.local_id, &self.config).await?;
        self.signals
            .send(
                &self.room_id,
                OutgoingMessage::ChatMessage { message: sealed },
            )
            .await?;
        Ok(())
    }

    pub async fn set_typing(&self, typing: bool) -> Result<(), MeshError> {
        self.signals
            .send(&self.room_id, OutgoingMessage::Typing { typing })
            .await?;
        Ok(())
    }

    pub async fn request_room_id(&self) -> Result<(), MeshError> {
        self.signals
            .send(&self.room_id, OutgoingMessage::GenerateRoomId)
            .await?;
        Ok(())
    }

    /// True when every current member has a connected session with an open aux
    /// channel. An empty room is never ready.
    pub fn can_send_bulk(&self) -> bool {
        let members = self.registry.members();
        !members.is_empty()
            && members.iter().all(|peer_id| {
                self.registry
                    .get(peer_id)
                    .is_some_and(|session| session.is_ready())
            })
    }

    /// Sends one payload to every member. Returns the transfer id.
    pub async fn send_bulk(
        &self,
        name: &str,
        mime: &str,
        data: Bytes,
    ) -> Result<String, MeshError> {
        let payload = BulkPayload {
            name: name.to_string(),
            mime: mime.to_string(),
            data,
        };
        transfer::validate(&payload, &self.config)?;

        let mut targets = Vec::new();
        let mut not_ready = Vec::new();
        for peer_id in self.registry.members() {
            match self
                .registry
                .get(&peer_id)
                .filter(|session| session.is_ready())
                .and_then(|session| session.aux_channel())
            {
                Some(channel) => targets.push(BulkTarget { peer_id, channel }),
                None => not_ready.push(peer_id),
            }
        }
        if targets.is_empty() || !not_ready.is_empty() {
            return Err(TransferError::PeersNotReady { peers: not_ready }.into());
        }
        Ok(self.bulk.send(&targets, &payload, &self.config).await?)
    }

    /// Acquires the microphone once and attaches it to every peer.
    pub async fn ensure_audio_track(&self) -> Result<Arc<LocalTrack>, MeshError> {
        let track = self.tracks.ensure_audio_track().await?;
        self.registry
            .publish(&TrackChange {
                slot: TrackSlot::Audio,
                track: Some(Arc::clone(&track)),
            })
            .await;
        Ok(track)
    }

    /// Mute without renegotiation. Returns false when there is no microphone.
    pub fn set_mic_enabled(&self, enabled: bool) -> bool {
        self.tracks.set_mic_enabled(enabled)
    }

    pub async fn start_camera(&self, device_id: Option<&str>) -> Result<Arc<LocalTrack>, MeshError> {
        let change = self.tracks.start_camera(device_id).await?;
        self.registry.publish(&change).await;
        change
            .track
            .ok_or_else(|| MediaError::CameraUnavailable("no track returned".into()).into())
    }

    pub async fn stop_camera(&self) {
        if let Some(change) = self.tracks.stop_camera() {
            self.registry.publish(&change).await;
        }
    }

    /// Starts sharing and stops automatically when the captured video ends.
    pub async fn start_screen_share(&self) -> Result<DisplayCapture, MeshError> {
        let (capture, changes) = self.tracks.start_screen_share().await?;
        for change in &changes {
            self.registry.publish(change).await;
        }

        let video = Arc::clone(&capture.video);
        let tracks = Arc::clone(&self.tracks);
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = video.ended() => {
                    let changes = tracks.stop_screen_share_if_current(video.id());
                    if !changes.is_empty() {
                        info!(target: "parley::media", "screen capture ended");
                    }
                    for change in &changes {
                        registry.publish(change).await;
                    }
                }
            }
        });
        self.tasks.lock().push(watcher);
        Ok(capture)
    }

    pub async fn stop_screen_share(&self) {
        for change in self.tracks.stop_screen_share() {
            self.registry.publish(&change).await;
        }
    }

    /// Closes every peer session and stops every local track. Idempotent.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(target: "parley::mesh", room_id = %self.room_id, "shutting down mesh");
        self.cancel.cancel();
        self.registry.shutdown().await;
        self.tracks.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn open_chat(&self, text: &str, from: &str) -> ChatContent {
        match self.keys.open(text, from).await {
            Ok(ChatBody::Decrypted(text)) => ChatContent::Decrypted(text),
            Ok(ChatBody::Plaintext(text)) => ChatContent::Plaintext(text),
            Err(err) => {
                debug!(
                    target: "parley::crypto",
                    from,
                    error = %err,
                    len = text.len(),
                    "failed to open chat message"
                );
                ChatContent::Undecryptable(err.user_message().to_string())
            }
        }
    }

    /// Hands signaling to the sender's session. Signals not addressed to us, or from
    /// peers outside the current membership, are stale and dropped.
    async fn route_signal(&self, from: Option<String>, to: &str, signal: InboundSignal) {
        let Some(from) = from else {
            debug!(target: "parley::negotiation", "dropping signal without sender");
            return;
        };
        if to != self.local_id || !self.registry.is_member(&from) {
            debug!(
                target: "parley::negotiation",
                peer_id = %from,
                to,
                "dropping stale signal"
            );
            return;
        }
        let session = match self.registry.get(&from) {
            Some(session) => session,
            None => match self.registry.create(&from).await {
                Ok(session) => session,
                Err(err) => {
                    warn!(
                        target: "parley::mesh",
                        peer_id = %from,
                        error = %err,
                        "cannot create session for signal"
                    );
                    return;
                }
            },
        };
        session.deliver(signal);
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Turns session notices into mesh events, feeding aux channel frames through the
/// bulk receiver on the way.
async fn forward_notices(
    mut notices: mpsc::UnboundedReceiver<PeerNotice>,
    mut receiver: BulkReceiver,
    events: broadcast::Sender<MeshEvent>,
    cancel: CancellationToken,
) {
    loop {
        let notice = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notice = notices.recv() => match notice {
                Some(notice) => notice,
                None => break,
            },
        };
        let event = match notice {
            PeerNotice::Added { peer_id } => MeshEvent::PeerAdded { peer_id },
            PeerNotice::Removed { peer_id } => {
                receiver.drop_peer(&peer_id);
                MeshEvent::PeerRemoved { peer_id }
            }
            PeerNotice::Connection { peer_id, state } => {
                MeshEvent::ConnectionStateChanged { peer_id, state }
            }
            PeerNotice::Track {
                peer_id,
                track,
                class,
            } => MeshEvent::RemoteTrackAdded {
                peer_id,
                track,
                class,
            },
            PeerNotice::AuxChannel { peer_id, open } => {
                MeshEvent::AuxChannelChanged { peer_id, open }
            }
            PeerNotice::Message { peer_id, message } => {
                match receiver.ingest(&peer_id, message) {
                    Ok(Some(completed)) => MeshEvent::TransferCompleted(completed),
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(
                            target: "parley::transfer",
                            peer_id = %peer_id,
                            error = %err,
                            "rejected aux channel frame"
                        );
                        continue;
                    }
                }
            }
        };
        let _ = events.send(event);
    }
}
