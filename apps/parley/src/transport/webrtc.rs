use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parley_proto::{IceCandidate, SdpKind, SessionDescription};
use tokio::sync::Notify;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    AuxChannel, ChannelMessage, ChannelObserver, ChannelState, ConnectionState, MediaKind,
    PeerObserver, PeerTransport, RemoteTrack, SenderId, SignalingState, TransportError,
    TransportFactory,
};
use crate::media::LocalTrack;

type ObserverSlot<T> = Arc<Mutex<Option<Arc<T>>>>;

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        local_id: &str,
        peer_id: &str,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            let mut server = RTCIceServer::default();
            server.urls = self.ice_servers.clone();
            config.ice_servers = vec![server];
        }
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(to_setup_error)?;
        tracing::debug!(
            target: "parley::transport",
            local_id,
            peer_id,
            "created peer connection"
        );
        Ok(WebRtcTransport::new(Arc::new(pc)))
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    observer: ObserverSlot<dyn PeerObserver>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl WebRtcTransport {
    fn new(pc: Arc<RTCPeerConnection>) -> Arc<Self> {
        let observer: ObserverSlot<dyn PeerObserver> = Arc::new(Mutex::new(None));
        register_peer_handlers(&pc, &observer);
        Arc::new(Self {
            pc,
            observer,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(0),
        })
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, TransportError> {
        self.senders
            .lock()
            .get(&id)
            .cloned()
            .ok_or(TransportError::UnknownSender(id))
    }
}

fn current<T: ?Sized>(slot: &ObserverSlot<T>) -> Option<Arc<T>> {
    slot.lock().clone()
}

fn register_peer_handlers(pc: &Arc<RTCPeerConnection>, observer: &ObserverSlot<dyn PeerObserver>) {
    let slot = Arc::clone(observer);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let slot = Arc::clone(&slot);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    if let Some(observer) = current(&slot) {
                        observer.on_ice_candidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "parley::transport", error = %err, "failed to serialize local candidate");
                }
            }
        })
    }));

    let slot = Arc::clone(observer);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let slot = Arc::clone(&slot);
        Box::pin(async move {
            if let Some(observer) = current(&slot) {
                observer.on_connection_state_change(map_connection_state(state));
            }
        })
    }));

    let slot = Arc::clone(observer);
    pc.on_negotiation_needed(Box::new(move || {
        let slot = Arc::clone(&slot);
        Box::pin(async move {
            if let Some(observer) = current(&slot) {
                observer.on_negotiation_needed();
            }
        })
    }));

    let slot = Arc::clone(observer);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                let id = track.id();
                let stream_id = track.stream_id();
                let remote = RemoteTrack {
                    label: format!("{stream_id} {id}"),
                    kind: match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        _ => MediaKind::Video,
                    },
                    id,
                    stream_id,
                };
                if let Some(observer) = current(&slot) {
                    observer.on_track(remote);
                }
            })
        },
    ));

    let slot = Arc::clone(observer);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let slot = Arc::clone(&slot);
        Box::pin(async move {
            let channel = WebRtcChannel::new(dc).await;
            if let Some(observer) = current(&slot) {
                observer.on_data_channel(channel);
            }
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Description(
                "unspecified sdp type".to_string(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let describe = |err: webrtc::Error| TransportError::Description(err.to_string());
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(describe),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(describe),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(describe),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            Ok(rollback)
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        mut description: SessionDescription,
    ) -> Result<(), TransportError> {
        // An empty rollback is rejected by the stack; reuse the pending offer body.
        if description.kind == SdpKind::Rollback && description.sdp.is_empty() {
            if let Some(pending) = self.pc.pending_local_description().await {
                description.sdp = pending.sdp;
            }
        }
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|err| TransportError::InvalidState(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|err| TransportError::InvalidState(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<SenderId, TransportError> {
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = self.pc.add_track(rtp).await.map_err(to_setup_error)?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(id, Arc::clone(&sender));

        // RTCP has to be drained for the interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<Arc<LocalTrack>>,
    ) -> Result<(), TransportError> {
        let rtp_sender = self.sender(sender)?;
        let rtp = track.map(|t| -> Arc<dyn TrackLocal + Send + Sync> { t.rtp_track() });
        rtp_sender
            .replace_track(rtp)
            .await
            .map_err(to_setup_error)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError> {
        let rtp_sender = self.sender(sender)?;
        self.pc
            .remove_track(&rtp_sender)
            .await
            .map_err(to_setup_error)?;
        self.senders.lock().remove(&sender);
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn AuxChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))?;
        let channel: Arc<dyn AuxChannel> = WebRtcChannel::new(dc).await;
        Ok(channel)
    }

    fn set_observer(&self, observer: Arc<dyn PeerObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn detach(&self) {
        self.observer.lock().take();
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))
    }
}

/// Inbound frames for a channel. Frames that arrive before an observer is attached
/// wait in the backlog and are replayed, in order, on attach.
#[derive(Default)]
struct Inbox {
    observer: Option<Arc<dyn ChannelObserver>>,
    backlog: Vec<ChannelMessage>,
}

impl Inbox {
    fn deliver(&mut self, message: ChannelMessage) {
        match &self.observer {
            Some(observer) => observer.on_message(message),
            None => self.backlog.push(message),
        }
    }

    fn attach(&mut self, observer: Arc<dyn ChannelObserver>) {
        for message in self.backlog.drain(..) {
            observer.on_message(message);
        }
        self.observer = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn ChannelObserver>> {
        self.observer.clone()
    }
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    inbox: Arc<Mutex<Inbox>>,
    low: Arc<Notify>,
    low_threshold: AtomicUsize,
}

impl WebRtcChannel {
    async fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        let low = Arc::new(Notify::new());

        let slot = Arc::clone(&inbox);
        dc.on_open(Box::new(move || {
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                let observer = slot.lock().observer();
                if let Some(observer) = observer {
                    observer.on_open();
                }
            })
        }));

        let slot = Arc::clone(&inbox);
        let closed = Arc::clone(&low);
        dc.on_close(Box::new(move || {
            let slot = Arc::clone(&slot);
            let closed = Arc::clone(&closed);
            Box::pin(async move {
                closed.notify_waiters();
                let observer = slot.lock().observer();
                if let Some(observer) = observer {
                    observer.on_close();
                }
            })
        }));

        let slot = Arc::clone(&inbox);
        let label = dc.label().to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let slot = Arc::clone(&slot);
            let label = label.clone();
            Box::pin(async move {
                let message = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelMessage::Text(text),
                        Err(err) => {
                            tracing::warn!(
                                target: "parley::transport",
                                channel = %label,
                                error = %err,
                                "dropping non utf-8 text frame"
                            );
                            return;
                        }
                    }
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                slot.lock().deliver(message);
            })
        }));

        let notify = Arc::clone(&low);
        dc.on_buffered_amount_low(Box::new(move || {
            let notify = Arc::clone(&notify);
            Box::pin(async move {
                notify.notify_waiters();
            })
        }))
        .await;

        Arc::new(Self {
            dc,
            inbox,
            low,
            low_threshold: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AuxChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
        self.dc.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn buffered_amount_low(&self) {
        loop {
            let notified = self.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.dc.buffered_amount().await <= self.low_threshold.load(Ordering::SeqCst)
                || self.state() == ChannelState::Closed
            {
                return;
            }
            notified.await;
        }
    }

    fn set_observer(&self, observer: Arc<dyn ChannelObserver>) {
        self.inbox.lock().attach(observer);
    }

    fn detach(&self) {
        self.inbox.lock().observer.take();
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc
            .close()
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))
    }
}
