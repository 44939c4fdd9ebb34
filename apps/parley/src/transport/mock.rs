//! Deterministic in-memory transport binding.
//!
//! Transports find their counterpart through a shared [`MockNetwork`]. Descriptions
//! carry a JSON inventory of tracks and channels instead of real SDP. Connectivity is
//! declared once both descriptions are in place, at which point locally created
//! channels are paired with a fresh endpoint announced on the remote transport.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parley_proto::{IceCandidate, SdpKind, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::{
    AuxChannel, ChannelMessage, ChannelObserver, ChannelState, ConnectionState, MediaKind,
    PeerObserver, PeerTransport, RemoteTrack, SenderId, SignalingState, TransportError,
    TransportFactory,
};
use crate::media::LocalTrack;

type PairKey = (String, String);

/// Registry of live mock transports keyed by (local id, remote id).
#[derive(Default)]
pub struct MockNetwork {
    transports: Mutex<HashMap<PairKey, Weak<MockTransport>>>,
    created: Mutex<HashMap<PairKey, usize>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(&self, local_id: &str, remote_id: &str) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .get(&(local_id.to_string(), remote_id.to_string()))
            .and_then(Weak::upgrade)
    }

    /// Number of transports ever created for the pair.
    pub fn created_count(&self, local_id: &str, remote_id: &str) -> usize {
        self.created
            .lock()
            .get(&(local_id.to_string(), remote_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn register(&self, transport: &Arc<MockTransport>) {
        let key = (transport.local_id.clone(), transport.remote_id.clone());
        *self.created.lock().entry(key.clone()).or_insert(0) += 1;
        self.transports.lock().insert(key, Arc::downgrade(transport));
    }
}

pub struct MockTransportFactory {
    network: Arc<MockNetwork>,
    creation_delay: Option<Duration>,
}

impl MockTransportFactory {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        Self {
            network,
            creation_delay: None,
        }
    }

    /// Suspends every creation, widening the window for concurrent create calls.
    pub fn with_creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay = Some(delay);
        self
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        local_id: &str,
        peer_id: &str,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if let Some(delay) = self.creation_delay {
            tokio::time::sleep(delay).await;
        }
        let transport = MockTransport::new(&self.network, local_id, peer_id);
        self.network.register(&transport);
        Ok(transport)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockSdp {
    owner: String,
    tracks: Vec<MockSdpTrack>,
    channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockSdpTrack {
    id: String,
    stream_id: String,
    audio: bool,
    label: String,
}

impl MockSdp {
    fn parse(description: &SessionDescription) -> Result<Self, TransportError> {
        serde_json::from_str(&description.sdp)
            .map_err(|err| TransportError::Description(format!("unparsable mock sdp: {err}")))
    }
}

enum Emit {
    NegotiationNeeded,
    Candidate(IceCandidate),
    Connection(ConnectionState),
    Track(RemoteTrack),
}

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    current_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    senders: BTreeMap<SenderId, Option<Arc<LocalTrack>>>,
    next_sender: u64,
    channels: Vec<Arc<MockChannel>>,
    negotiation_pending: bool,
    announced: HashSet<String>,
    applied_candidates: Vec<IceCandidate>,
    gathered: bool,
}

impl MockState {
    fn has_remote(&self) -> bool {
        self.current_remote.is_some() || self.pending_remote.is_some()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.signaling == SignalingState::Closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn mark_negotiation_needed(&mut self, emits: &mut Vec<Emit>) {
        if self.signaling == SignalingState::Stable {
            emits.push(Emit::NegotiationNeeded);
        } else {
            self.negotiation_pending = true;
        }
    }

    fn announce(&mut self, sdp: &MockSdp, emits: &mut Vec<Emit>) {
        for track in &sdp.tracks {
            if self.announced.insert(track.id.clone()) {
                emits.push(Emit::Track(RemoteTrack {
                    id: track.id.clone(),
                    stream_id: track.stream_id.clone(),
                    kind: if track.audio {
                        MediaKind::Audio
                    } else {
                        MediaKind::Video
                    },
                    label: track.label.clone(),
                }));
            }
        }
    }

    /// Returns true when channels should be paired.
    fn settle(&mut self, emits: &mut Vec<Emit>) -> bool {
        if self.signaling != SignalingState::Stable {
            return false;
        }
        if self.current_local.is_some()
            && self.current_remote.is_some()
            && matches!(
                self.connection,
                ConnectionState::New | ConnectionState::Connecting
            )
        {
            if self.connection == ConnectionState::New {
                emits.push(Emit::Connection(ConnectionState::Connecting));
            }
            self.connection = ConnectionState::Connected;
            emits.push(Emit::Connection(ConnectionState::Connected));
        }
        if self.negotiation_pending {
            self.negotiation_pending = false;
            emits.push(Emit::NegotiationNeeded);
        }
        self.connection == ConnectionState::Connected
    }
}

pub struct MockTransport {
    local_id: String,
    remote_id: String,
    network: Weak<MockNetwork>,
    state: Mutex<MockState>,
    observer: Mutex<Option<Arc<dyn PeerObserver>>>,
    offers_created: AtomicUsize,
    answers_created: AtomicUsize,
}

impl MockTransport {
    pub fn new(network: &Arc<MockNetwork>, local_id: &str, remote_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            network: Arc::downgrade(network),
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                current_local: None,
                current_remote: None,
                pending_local: None,
                pending_remote: None,
                senders: BTreeMap::new(),
                next_sender: 0,
                channels: Vec::new(),
                negotiation_pending: false,
                announced: HashSet::new(),
                applied_candidates: Vec::new(),
                gathered: false,
            }),
            observer: Mutex::new(None),
            offers_created: AtomicUsize::new(0),
            answers_created: AtomicUsize::new(0),
        })
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers_created.load(Ordering::SeqCst)
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Channels created on this side.
    pub fn local_channels(&self) -> Vec<Arc<MockChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    pub fn sender_track(&self, sender: SenderId) -> Option<Arc<LocalTrack>> {
        self.state.lock().senders.get(&sender).cloned().flatten()
    }

    /// Simulates an ICE failure surfacing on this side.
    pub fn fail_connection(&self) {
        let emits = {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = ConnectionState::Failed;
            vec![Emit::Connection(ConnectionState::Failed)]
        };
        self.emit(emits);
    }

    fn describe(&self, state: &MockState) -> Result<String, TransportError> {
        let sdp = MockSdp {
            owner: self.local_id.clone(),
            tracks: state
                .senders
                .values()
                .flatten()
                .map(|track| MockSdpTrack {
                    id: track.id().to_string(),
                    stream_id: track.stream_id().to_string(),
                    audio: track.kind() == MediaKind::Audio,
                    label: track.label().to_string(),
                })
                .collect(),
            channels: state.channels.iter().map(|c| c.label.clone()).collect(),
        };
        serde_json::to_string(&sdp).map_err(|err| TransportError::Description(err.to_string()))
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host mock {}>{}",
                self.local_id, self.remote_id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn emit(&self, emits: Vec<Emit>) {
        if emits.is_empty() {
            return;
        }
        let Some(observer) = self.observer.lock().clone() else {
            return;
        };
        for event in emits {
            match event {
                Emit::NegotiationNeeded => observer.on_negotiation_needed(),
                Emit::Candidate(candidate) => observer.on_ice_candidate(candidate),
                Emit::Connection(state) => observer.on_connection_state_change(state),
                Emit::Track(track) => observer.on_track(track),
            }
        }
    }

    fn remote(&self) -> Option<Arc<MockTransport>> {
        self.network
            .upgrade()
            .and_then(|network| network.transport(&self.remote_id, &self.local_id))
    }

    fn pair_channels(&self) {
        let unpaired: Vec<_> = self
            .state
            .lock()
            .channels
            .iter()
            .filter(|c| !c.is_paired())
            .cloned()
            .collect();
        if unpaired.is_empty() {
            return;
        }
        let Some(remote) = self.remote() else {
            return;
        };
        for local in unpaired {
            let endpoint = MockChannel::new(&local.label);
            MockChannel::link(&local, &endpoint);
            endpoint.mark_open();
            remote.announce_channel(endpoint);
            local.open();
        }
    }

    fn announce_channel(&self, channel: Arc<MockChannel>) {
        if self.state.lock().signaling == SignalingState::Closed {
            return;
        }
        if let Some(observer) = self.observer.lock().clone() {
            observer.on_data_channel(channel);
        }
    }

    fn remote_closed(&self) {
        let emits = {
            let mut state = self.state.lock();
            if matches!(
                state.connection,
                ConnectionState::Closed | ConnectionState::Disconnected
            ) {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            vec![Emit::Connection(ConnectionState::Disconnected)]
        };
        self.emit(emits);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        state.ensure_open()?;
        let sdp = self.describe(&state)?;
        self.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.state.lock();
        state.ensure_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(TransportError::InvalidState(format!(
                "create answer in {:?}",
                state.signaling
            )));
        }
        let sdp = self.describe(&state)?;
        self.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut emits = Vec::new();
        let pair = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match (description.kind, state.signaling) {
                (SdpKind::Rollback, SignalingState::HaveLocalOffer) => {
                    state.pending_local = None;
                    state.signaling = SignalingState::Stable;
                }
                (SdpKind::Rollback, SignalingState::HaveRemoteOffer) => {
                    state.pending_remote = None;
                    state.signaling = SignalingState::Stable;
                }
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.pending_local = Some(description.clone());
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveRemoteOffer) => {
                    state.current_remote = state.pending_remote.take();
                    state.current_local = Some(description.clone());
                    state.signaling = SignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(TransportError::InvalidState(format!(
                        "set local {kind:?} in {signaling:?}"
                    )));
                }
            }
            if description.kind != SdpKind::Rollback && !state.gathered {
                state.gathered = true;
                emits.push(Emit::Candidate(self.host_candidate()));
            }
            state.settle(&mut emits)
        };
        self.emit(emits);
        if pair {
            self.pair_channels();
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut emits = Vec::new();
        let pair = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    let sdp = MockSdp::parse(&description)?;
                    state.pending_remote = Some(description);
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.announce(&sdp, &mut emits);
                }
                (SdpKind::Answer | SdpKind::Pranswer, SignalingState::HaveLocalOffer) => {
                    let sdp = MockSdp::parse(&description)?;
                    state.current_local = state.pending_local.take();
                    state.current_remote = Some(description);
                    state.signaling = SignalingState::Stable;
                    state.announce(&sdp, &mut emits);
                }
                (kind, signaling) => {
                    return Err(TransportError::InvalidState(format!(
                        "set remote {kind:?} in {signaling:?}"
                    )));
                }
            }
            state.settle(&mut emits)
        };
        self.emit(emits);
        if pair {
            self.pair_channels();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !state.has_remote() {
            return Err(TransportError::Candidate(
                "no remote description".to_string(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError> {
        let mut emits = Vec::new();
        let sender = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let sender = SenderId(state.next_sender);
            state.next_sender += 1;
            state.senders.insert(sender, Some(track));
            state.mark_negotiation_needed(&mut emits);
            sender
        };
        self.emit(emits);
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let slot = state
            .senders
            .get_mut(&sender)
            .ok_or(TransportError::UnknownSender(sender))?;
        *slot = track;
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError> {
        let mut emits = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if state.senders.remove(&sender).is_none() {
                return Err(TransportError::UnknownSender(sender));
            }
            state.mark_negotiation_needed(&mut emits);
        }
        self.emit(emits);
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn AuxChannel>, TransportError> {
        let mut emits = Vec::new();
        let channel = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let channel = MockChannel::new(label);
            state.channels.push(Arc::clone(&channel));
            state.mark_negotiation_needed(&mut emits);
            channel
        };
        self.emit(emits);
        Ok(channel)
    }

    fn set_observer(&self, observer: Arc<dyn PeerObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn detach(&self) {
        self.observer.lock().take();
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channels = {
            let mut state = self.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.shutdown();
        }
        if let Some(remote) = self.remote() {
            remote.remote_closed();
        }
        Ok(())
    }
}

/// One endpoint of an in-memory data channel.
pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    peer: Mutex<Weak<MockChannel>>,
    /// Held while delivering so inbound order survives observer registration.
    observer: Mutex<Option<Arc<dyn ChannelObserver>>>,
    backlog: Mutex<Vec<ChannelMessage>>,
    sent: Mutex<Vec<ChannelMessage>>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    low: Notify,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            observer: Mutex::new(None),
            backlog: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            low: Notify::new(),
        })
    }

    /// Two linked, already open endpoints.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label);
        let b = Self::new(label);
        Self::link(&a, &b);
        a.mark_open();
        b.mark_open();
        (a, b)
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    fn is_paired(&self) -> bool {
        self.peer.lock().upgrade().is_some()
    }

    pub fn sent_messages(&self) -> Vec<ChannelMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_binary_count(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m, ChannelMessage::Binary(_)))
            .count()
    }

    /// Test hook standing in for the transport's send queue.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
        if amount <= self.low_threshold.load(Ordering::SeqCst) {
            self.low.notify_waiters();
        }
    }

    fn mark_open(&self) {
        *self.state.lock() = ChannelState::Open;
    }

    fn open(&self) {
        self.mark_open();
        if let Some(observer) = self.observer.lock().as_ref() {
            observer.on_open();
        }
    }

    fn deliver(&self, message: ChannelMessage) {
        let observer = self.observer.lock();
        match observer.as_ref() {
            Some(observer) => observer.on_message(message),
            None => self.backlog.lock().push(message),
        }
    }

    fn remote_closed(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.low.notify_waiters();
        if let Some(observer) = self.observer.lock().as_ref() {
            observer.on_close();
        }
    }

    fn shutdown(&self) {
        let peer = self.peer.lock().upgrade();
        self.remote_closed();
        if let Some(peer) = peer {
            peer.remote_closed();
        }
    }

    fn transmit(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if *self.state.lock() != ChannelState::Open {
            return Err(TransportError::Channel(format!(
                "channel {} is not open",
                self.label
            )));
        }
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| TransportError::Channel("remote endpoint gone".to_string()))?;
        self.sent.lock().push(message.clone());
        peer.deliver(message);
        Ok(())
    }
}

#[async_trait]
impl AuxChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.transmit(ChannelMessage::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.transmit(ChannelMessage::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn buffered_amount_low(&self) {
        loop {
            let notified = self.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.buffered.load(Ordering::SeqCst) <= self.low_threshold.load(Ordering::SeqCst)
                || *self.state.lock() == ChannelState::Closed
            {
                return;
            }
            notified.await;
        }
    }

    fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        let mut slot = self.observer.lock();
        for message in self.backlog.lock().drain(..) {
            observer.on_message(message);
        }
        *slot = Some(observer);
    }

    fn detach(&self) {
        self.observer.lock().take();
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSlot;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        channels: Mutex<Vec<Arc<dyn AuxChannel>>>,
    }

    impl PeerObserver for Recorder {
        fn on_track(&self, track: RemoteTrack) {
            self.events.lock().push(format!("track:{}", track.label));
        }
        fn on_ice_candidate(&self, _candidate: IceCandidate) {
            self.events.lock().push("candidate".into());
        }
        fn on_connection_state_change(&self, state: ConnectionState) {
            self.events.lock().push(format!("state:{state}"));
        }
        fn on_data_channel(&self, channel: Arc<dyn AuxChannel>) {
            self.events.lock().push(format!("channel:{}", channel.label()));
            self.channels.lock().push(channel);
        }
        fn on_negotiation_needed(&self) {
            self.events.lock().push("negotiate".into());
        }
    }

    impl ChannelObserver for Recorder {
        fn on_open(&self) {
            self.events.lock().push("open".into());
        }
        fn on_close(&self) {
            self.events.lock().push("close".into());
        }
        fn on_message(&self, message: ChannelMessage) {
            self.events.lock().push(format!("message:{}", message.len()));
        }
    }

    fn pair() -> (Arc<MockNetwork>, Arc<MockTransport>, Arc<MockTransport>) {
        let network = MockNetwork::new();
        let a = MockTransport::new(&network, "a1", "b2");
        let b = MockTransport::new(&network, "b2", "a1");
        network.register(&a);
        network.register(&b);
        (network, a, b)
    }

    async fn exchange(offerer: &MockTransport, answerer: &MockTransport) {
        let offer = offerer.create_offer().await.expect("offer");
        offerer
            .set_local_description(offer.clone())
            .await
            .expect("local offer");
        answerer.set_remote_description(offer).await.expect("remote offer");
        let answer = answerer.create_answer().await.expect("answer");
        answerer
            .set_local_description(answer.clone())
            .await
            .expect("local answer");
        offerer
            .set_remote_description(answer)
            .await
            .expect("remote answer");
    }

    #[tokio::test]
    async fn offer_answer_reaches_connected() {
        let (_net, a, b) = pair();
        exchange(&a, &b).await;
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn candidates_require_remote_description() {
        let (_net, a, b) = pair();
        let candidate = b.host_candidate();
        assert!(matches!(
            a.add_ice_candidate(candidate.clone()).await,
            Err(TransportError::Candidate(_))
        ));
        exchange(&a, &b).await;
        a.add_ice_candidate(candidate).await.expect("after answer");
        assert_eq!(a.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn rollback_returns_to_stable() {
        let (_net, a, _b) = pair();
        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer).await.expect("local");
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);
        a.set_local_description(SessionDescription::rollback())
            .await
            .expect("rollback");
        assert_eq!(a.signaling_state(), SignalingState::Stable);
        assert!(
            a.set_local_description(SessionDescription::rollback())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn remote_offer_during_local_offer_is_rejected() {
        let (_net, a, b) = pair();
        let offer_a = a.create_offer().await.expect("offer a");
        a.set_local_description(offer_a).await.expect("local a");
        let offer_b = b.create_offer().await.expect("offer b");
        assert!(matches!(
            a.set_remote_description(offer_b).await,
            Err(TransportError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn observer_sees_negotiation_candidate_tracks_and_channel() {
        let (_net, a, b) = pair();
        let recorder_a = Arc::new(Recorder::default());
        let recorder_b = Arc::new(Recorder::default());
        a.set_observer(recorder_a.clone());
        b.set_observer(recorder_b.clone());

        a.add_track(LocalTrack::new(TrackSlot::Screen, "Screen 1"))
            .await
            .expect("track");
        let channel = a.create_channel("bulk").await.expect("channel");
        channel.set_observer(recorder_a.clone());
        exchange(&a, &b).await;

        let events_a = recorder_a.events.lock().clone();
        assert_eq!(events_a.iter().filter(|e| *e == "negotiate").count(), 2);
        assert!(events_a.contains(&"candidate".to_string()));
        assert!(events_a.contains(&"state:connected".to_string()));
        assert!(events_a.contains(&"open".to_string()));

        let events_b = recorder_b.events.lock().clone();
        assert!(events_b.contains(&"track:Screen 1".to_string()));
        assert!(events_b.contains(&"channel:bulk".to_string()));

        let remote_channel = recorder_b.channels.lock()[0].clone();
        assert!(remote_channel.is_open());
        channel.send_text("hi".into()).await.expect("send");
        remote_channel.set_observer(recorder_b.clone());
        assert!(recorder_b.events.lock().contains(&"message:2".to_string()));
    }

    #[tokio::test]
    async fn negotiation_needed_deferred_until_stable() {
        let (_net, a, _b) = pair();
        let recorder = Arc::new(Recorder::default());
        a.set_observer(recorder.clone());
        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer).await.expect("local");
        a.add_track(LocalTrack::new(TrackSlot::Audio, "mic"))
            .await
            .expect("track");
        assert!(!recorder.events.lock().contains(&"negotiate".to_string()));
        a.set_local_description(SessionDescription::rollback())
            .await
            .expect("rollback");
        assert!(recorder.events.lock().contains(&"negotiate".to_string()));
    }

    #[tokio::test]
    async fn detached_observer_receives_nothing() {
        let (_net, a, _b) = pair();
        let recorder = Arc::new(Recorder::default());
        a.set_observer(recorder.clone());
        a.detach();
        a.add_track(LocalTrack::new(TrackSlot::Audio, "mic"))
            .await
            .expect("track");
        assert!(recorder.events.lock().is_empty());
    }

    #[tokio::test]
    async fn close_closes_channels_and_disconnects_remote() {
        let (_net, a, b) = pair();
        let recorder_b = Arc::new(Recorder::default());
        b.set_observer(recorder_b.clone());
        let channel = a.create_channel("bulk").await.expect("channel");
        exchange(&a, &b).await;
        a.close().await.expect("close");
        assert_eq!(a.connection_state(), ConnectionState::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(b.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(a.create_offer().await, Err(TransportError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_low_wakes_waiter() {
        let (tx, _rx) = MockChannel::pair("bulk");
        tx.set_buffered_amount_low_threshold(10).await;
        tx.set_buffered_amount(100);
        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.buffered_amount_low().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.set_buffered_amount(5);
        waiter.await.expect("waiter");
    }
}
