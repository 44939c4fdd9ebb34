use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use parley_proto::{IceCandidate, OutgoingMessage, SessionDescription};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::negotiation::{Negotiator, Politeness, SignalingPhase};
use crate::media::{LocalTrack, RemoteStreams, StreamClass, TrackClassifier, TrackSlot};
use crate::relay::SignalSink;
use crate::transport::{
    AUX_CHANNEL_LABEL, AuxChannel, ChannelMessage, ChannelObserver, ConnectionState,
    PeerObserver, PeerTransport, RemoteTrack, SenderId, TransportError,
};

/// What a peer session reports back to its mesh.
#[derive(Debug, Clone)]
pub enum PeerNotice {
    Added {
        peer_id: String,
    },
    Removed {
        peer_id: String,
    },
    Connection {
        peer_id: String,
        state: ConnectionState,
    },
    Track {
        peer_id: String,
        track: RemoteTrack,
        class: StreamClass,
    },
    AuxChannel {
        peer_id: String,
        open: bool,
    },
    Message {
        peer_id: String,
        message: ChannelMessage,
    },
}

/// Signaling addressed to one peer session, applied in arrival order.
#[derive(Debug, Clone)]
pub enum InboundSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Everything a session borrows from its mesh.
#[derive(Clone)]
pub struct SessionContext {
    pub local_id: String,
    pub room_id: String,
    pub signals: Arc<dyn SignalSink>,
    pub classifier: Arc<dyn TrackClassifier>,
    pub notices: mpsc::UnboundedSender<PeerNotice>,
    pub buffered_low_water: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub politeness: Politeness,
    pub phase: SignalingPhase,
    pub connection: ConnectionState,
    pub aux_open: bool,
    pub senders: Vec<TrackSlot>,
    pub remote: RemoteStreams,
}

enum TransportEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    Connection(ConnectionState),
    Track(RemoteTrack),
    DataChannel(Arc<dyn AuxChannel>),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(ChannelMessage),
}

/// Forwards transport callbacks into the session task until the session is cancelled.
struct SessionObserver {
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl SessionObserver {
    fn forward(&self, event: TransportEvent) {
        if !self.cancel.is_cancelled() {
            let _ = self.events.send(event);
        }
    }
}

impl PeerObserver for SessionObserver {
    fn on_track(&self, track: RemoteTrack) {
        self.forward(TransportEvent::Track(track));
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.forward(TransportEvent::LocalCandidate(candidate));
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        self.forward(TransportEvent::Connection(state));
    }

    fn on_data_channel(&self, channel: Arc<dyn AuxChannel>) {
        self.forward(TransportEvent::DataChannel(channel));
    }

    fn on_negotiation_needed(&self) {
        self.forward(TransportEvent::NegotiationNeeded);
    }
}

impl ChannelObserver for SessionObserver {
    fn on_open(&self) {
        self.forward(TransportEvent::ChannelOpen);
    }

    fn on_close(&self) {
        self.forward(TransportEvent::ChannelClosed);
    }

    fn on_message(&self, message: ChannelMessage) {
        self.forward(TransportEvent::ChannelMessage(message));
    }
}

/// One remote participant: its transport, negotiation state, senders and aux channel.
///
/// A single task applies transport callbacks and inbound signaling in order. Closing
/// cancels that task and detaches every observer before the transport is closed.
pub struct PeerSession {
    peer_id: String,
    ctx: SessionContext,
    transport: Arc<dyn PeerTransport>,
    negotiator: Negotiator,
    observer: Arc<SessionObserver>,
    signals: mpsc::UnboundedSender<InboundSignal>,
    senders: AsyncMutex<HashMap<TrackSlot, SenderId>>,
    aux: Mutex<Option<Arc<dyn AuxChannel>>>,
    aux_open: AtomicBool,
    remote: Mutex<RemoteStreams>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl PeerSession {
    /// Wires the observer and spawns the session task.
    pub fn start(
        ctx: SessionContext,
        peer_id: &str,
        transport: Arc<dyn PeerTransport>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let observer = Arc::new(SessionObserver {
            events: event_tx,
            cancel: cancel.clone(),
        });
        transport.set_observer(observer.clone());
        let session = Arc::new(Self {
            peer_id: peer_id.to_string(),
            negotiator: Negotiator::new(&ctx.room_id, &ctx.local_id, peer_id),
            ctx,
            transport,
            observer,
            signals: signal_tx,
            senders: AsyncMutex::new(HashMap::new()),
            aux: Mutex::new(None),
            aux_open: AtomicBool::new(false),
            remote: Mutex::new(RemoteStreams::default()),
            closed: AtomicBool::new(false),
            cancel,
        });
        tokio::spawn(Arc::clone(&session).drive(event_rx, signal_rx));
        session
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn politeness(&self) -> Politeness {
        self.negotiator.politeness()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connected with an open aux channel.
    pub fn is_ready(&self) -> bool {
        self.connection_state() == ConnectionState::Connected && self.aux_channel().is_some()
    }

    /// The aux channel, when it is open.
    pub fn aux_channel(&self) -> Option<Arc<dyn AuxChannel>> {
        if !self.aux_open.load(Ordering::Acquire) {
            return None;
        }
        self.aux.lock().clone().filter(|channel| channel.is_open())
    }

    pub fn remote_streams(&self) -> RemoteStreams {
        self.remote.lock().clone()
    }

    /// Queues inbound signaling for the session task.
    pub fn deliver(&self, signal: InboundSignal) {
        if self.signals.send(signal).is_err() {
            debug!(
                target: "parley::mesh",
                peer_id = %self.peer_id,
                "session task gone; dropping signal"
            );
        }
    }

    /// Creates the aux channel from this side.
    pub async fn open_aux_channel(&self) -> Result<(), TransportError> {
        let channel = self.transport.create_channel(AUX_CHANNEL_LABEL).await?;
        self.install_aux(channel).await;
        Ok(())
    }

    /// Applies one slot transition. Camera and microphone keep their sender and swap
    /// tracks in place; screen slots add or remove the sender outright.
    pub async fn set_sender(
        &self,
        slot: TrackSlot,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), TransportError> {
        let mut senders = self.senders.lock().await;
        match (senders.get(&slot).copied(), track) {
            (Some(sender), Some(track)) => self.transport.replace_track(sender, Some(track)).await,
            (None, Some(track)) => {
                let sender = self.transport.add_track(track).await?;
                senders.insert(slot, sender);
                Ok(())
            }
            (Some(sender), None) if slot.removed_on_stop() => {
                senders.remove(&slot);
                self.transport.remove_track(sender).await
            }
            (Some(sender), None) => self.transport.replace_track(sender, None).await,
            (None, None) => Ok(()),
        }
    }

    pub async fn snapshot(&self) -> PeerSnapshot {
        let mut senders: Vec<TrackSlot> = self.senders.lock().await.keys().copied().collect();
        senders.sort();
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            politeness: self.politeness(),
            phase: self.negotiator.phase(self.transport.as_ref()),
            connection: self.connection_state(),
            aux_open: self.aux_channel().is_some(),
            senders,
            remote: self.remote_streams(),
        }
    }

    /// Tears the session down. Returns false when it was already closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.transport.detach();
        let aux = self.aux.lock().take();
        self.aux_open.store(false, Ordering::Release);
        if let Some(channel) = aux {
            channel.detach();
            if let Err(err) = channel.close().await {
                debug!(
                    target: "parley::mesh",
                    peer_id = %self.peer_id,
                    error = %err,
                    "aux channel close failed"
                );
            }
        }
        if let Err(err) = self.transport.close().await {
            debug!(
                target: "parley::mesh",
                peer_id = %self.peer_id,
                error = %err,
                "transport close failed"
            );
        }
        true
    }

    async fn install_aux(&self, channel: Arc<dyn AuxChannel>) {
        channel
            .set_buffered_amount_low_threshold(self.ctx.buffered_low_water)
            .await;
        channel.set_observer(self.observer.clone());
        let open = channel.is_open();
        let previous = self.aux.lock().replace(channel);
        if let Some(previous) = previous {
            previous.detach();
        }
        if open {
            self.mark_aux(true);
        }
    }

    fn mark_aux(&self, open: bool) {
        if self.aux_open.swap(open, Ordering::AcqRel) == open {
            return;
        }
        debug!(
            target: "parley::mesh",
            peer_id = %self.peer_id,
            open,
            "aux channel state changed"
        );
        self.notify(PeerNotice::AuxChannel {
            peer_id: self.peer_id.clone(),
            open,
        });
    }

    fn notify(&self, notice: PeerNotice) {
        if !self.cancel.is_cancelled() {
            let _ = self.ctx.notices.send(notice);
        }
    }

    async fn drive(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut signals: mpsc::UnboundedReceiver<InboundSignal>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                else => break,
            }
        }
        debug!(target: "parley::mesh", peer_id = %self.peer_id, "session task stopped");
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::NegotiationNeeded => {
                if let Err(err) = self
                    .negotiator
                    .negotiate(self.transport.as_ref(), self.ctx.signals.as_ref())
                    .await
                {
                    warn!(
                        target: "parley::negotiation",
                        peer_id = %self.peer_id,
                        error = %err,
                        "negotiation failed"
                    );
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                let message = OutgoingMessage::IceCandidate {
                    candidate,
                    to: self.peer_id.clone(),
                };
                if let Err(err) = self.ctx.signals.send(&self.ctx.room_id, message).await {
                    warn!(
                        target: "parley::negotiation",
                        peer_id = %self.peer_id,
                        error = %err,
                        "failed to send local candidate"
                    );
                }
            }
            TransportEvent::Connection(state) => {
                info!(
                    target: "parley::mesh",
                    peer_id = %self.peer_id,
                    state = %state,
                    "connection state changed"
                );
                self.notify(PeerNotice::Connection {
                    peer_id: self.peer_id.clone(),
                    state,
                });
            }
            TransportEvent::Track(track) => {
                let class = self.ctx.classifier.classify(&track);
                if self.remote.lock().add(track.clone(), class) {
                    debug!(
                        target: "parley::media",
                        peer_id = %self.peer_id,
                        track_id = %track.id,
                        ?class,
                        "remote track added"
                    );
                    self.notify(PeerNotice::Track {
                        peer_id: self.peer_id.clone(),
                        track,
                        class,
                    });
                }
            }
            TransportEvent::DataChannel(channel) => {
                if channel.label() == AUX_CHANNEL_LABEL {
                    self.install_aux(channel).await;
                } else {
                    debug!(
                        target: "parley::mesh",
                        peer_id = %self.peer_id,
                        label = %channel.label(),
                        "ignoring unexpected data channel"
                    );
                }
            }
            TransportEvent::ChannelOpen => self.mark_aux(true),
            TransportEvent::ChannelClosed => self.mark_aux(false),
            TransportEvent::ChannelMessage(message) => {
                self.notify(PeerNotice::Message {
                    peer_id: self.peer_id.clone(),
                    message,
                });
            }
        }
    }

    async fn handle_signal(&self, signal: InboundSignal) {
        let transport = self.transport.as_ref();
        let result = match signal {
            InboundSignal::Offer(offer) => self
                .negotiator
                .handle_offer(offer, transport, self.ctx.signals.as_ref())
                .await
                .map(|outcome| {
                    debug!(
                        target: "parley::negotiation",
                        peer_id = %self.peer_id,
                        ?outcome,
                        "offer handled"
                    );
                }),
            InboundSignal::Answer(answer) => self.negotiator.handle_answer(answer, transport).await,
            InboundSignal::Candidate(candidate) => self
                .negotiator
                .handle_candidate(candidate, transport)
                .await
                .map(|_| ()),
        };
        if let Err(err) = result {
            warn!(
                target: "parley::negotiation",
                peer_id = %self.peer_id,
                error = %err,
                "failed to apply remote signal"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::default_classifier;
    use crate::relay::RelayError;
    use crate::transport::mock::{MockChannel, MockNetwork, MockTransport};
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl SignalSink for NullSink {
        async fn send(&self, _room: &str, _message: OutgoingMessage) -> Result<(), RelayError> {
            Ok(())
        }
    }

    fn context() -> (SessionContext, mpsc::UnboundedReceiver<PeerNotice>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            local_id: "a1".into(),
            room_id: "r1".into(),
            signals: Arc::new(NullSink),
            classifier: default_classifier(),
            notices,
            buffered_low_water: 1024,
        };
        (ctx, rx)
    }

    fn session() -> (
        Arc<MockNetwork>,
        Arc<MockTransport>,
        Arc<PeerSession>,
        mpsc::UnboundedReceiver<PeerNotice>,
    ) {
        let network = MockNetwork::new();
        let transport = MockTransport::new(&network, "a1", "b2");
        let (ctx, rx) = context();
        let session = PeerSession::start(ctx, "b2", transport.clone(), CancellationToken::new());
        (network, transport, session, rx)
    }

    #[tokio::test]
    async fn camera_reuses_sender_and_screen_removes_it() {
        let (_net, transport, session, _rx) = session();
        let first = LocalTrack::new(TrackSlot::Camera, "cam");
        let second = LocalTrack::new(TrackSlot::Camera, "usb cam");
        session
            .set_sender(TrackSlot::Camera, Some(first))
            .await
            .expect("add camera");
        session
            .set_sender(TrackSlot::Camera, Some(second.clone()))
            .await
            .expect("switch camera");
        assert_eq!(transport.sender_count(), 1);
        let sender = SenderId(0);
        assert_eq!(
            transport.sender_track(sender).map(|t| t.id().to_string()),
            Some(second.id().to_string())
        );

        session
            .set_sender(TrackSlot::Camera, None)
            .await
            .expect("stop camera");
        assert_eq!(transport.sender_count(), 1);
        assert!(transport.sender_track(sender).is_none());

        session
            .set_sender(TrackSlot::Screen, Some(LocalTrack::new(TrackSlot::Screen, "Screen 1")))
            .await
            .expect("share");
        assert_eq!(transport.sender_count(), 2);
        session
            .set_sender(TrackSlot::Screen, None)
            .await
            .expect("unshare");
        assert_eq!(transport.sender_count(), 1);
        assert_eq!(session.snapshot().await.senders, [TrackSlot::Camera]);
    }

    #[tokio::test]
    async fn inbound_aux_channel_reports_open_and_messages() {
        let (_net, _transport, session, mut rx) = session();
        let (local, remote) = MockChannel::pair(AUX_CHANNEL_LABEL);
        session.install_aux(local).await;
        assert!(matches!(
            rx.recv().await,
            Some(PeerNotice::AuxChannel { open: true, .. })
        ));
        assert!(session.aux_channel().is_some());

        remote.send_text("ping".into()).await.expect("send");
        match rx.recv().await {
            Some(PeerNotice::Message { peer_id, message }) => {
                assert_eq!(peer_id, "b2");
                assert_eq!(message, ChannelMessage::Text("ping".into()));
            }
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_silences_callbacks() {
        let (_net, transport, session, mut rx) = session();
        let (local, remote) = MockChannel::pair(AUX_CHANNEL_LABEL);
        session.install_aux(local).await;
        assert!(rx.recv().await.is_some());

        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(session.is_closed());
        assert_eq!(transport.connection_state(), ConnectionState::Closed);
        assert!(!remote.is_open());
        assert!(session.aux_channel().is_none());

        transport.fail_connection();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn politeness_is_fixed_from_ids() {
        let (_net, _transport, session, _rx) = session();
        assert_eq!(session.politeness(), Politeness::Impolite);
        assert_eq!(session.snapshot().await.phase, SignalingPhase::Stable);
    }
}
