//! Perfect negotiation for one peer pair.
//!
//! Politeness is fixed per pair from the id comparison. On an offer collision the
//! impolite side ignores the remote offer and the polite side rolls back its own.
//! Remote candidates that arrive before any remote description are queued and
//! flushed once one is applied.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use parley_proto::{IceCandidate, OutgoingMessage, SessionDescription};
use thiserror::Error;
use tracing::{debug, warn};

use crate::relay::{RelayError, SignalSink};
use crate::transport::{PeerTransport, SignalingState, TransportError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to signal peer: {0}")]
    Signal(#[from] RelayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Politeness {
    Polite,
    Impolite,
}

impl Politeness {
    /// The side whose id sorts higher yields on collisions.
    pub fn for_pair(local_id: &str, peer_id: &str) -> Self {
        if local_id > peer_id {
            Politeness::Polite
        } else {
            Politeness::Impolite
        }
    }

    pub fn is_polite(self) -> bool {
        self == Politeness::Polite
    }
}

/// Offer/answer phase as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingPhase {
    Stable,
    /// Our offer is outstanding (have-local-offer).
    AwaitingRemoteAnswer,
    /// A remote offer is applied and we owe an answer (have-remote-offer).
    AwaitingLocalAnswer,
    Closed,
}

impl From<SignalingState> for SignalingPhase {
    fn from(state: SignalingState) -> Self {
        match state {
            SignalingState::Stable => SignalingPhase::Stable,
            SignalingState::HaveLocalOffer => SignalingPhase::AwaitingRemoteAnswer,
            SignalingState::HaveRemoteOffer => SignalingPhase::AwaitingLocalAnswer,
            SignalingState::Closed => SignalingPhase::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Answered { rolled_back: bool },
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
    /// Rejected while a colliding remote offer is being ignored.
    Discarded,
}

pub struct Negotiator {
    room_id: String,
    peer_id: String,
    politeness: Politeness,
    making_offer: AtomicBool,
    ignore_offer: AtomicBool,
    pending_ice: Mutex<VecDeque<IceCandidate>>,
}

/// Clears `making_offer` however the offer attempt ends.
struct MakingOffer<'a>(&'a AtomicBool);

impl Drop for MakingOffer<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Negotiator {
    pub fn new(room_id: &str, local_id: &str, peer_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            politeness: Politeness::for_pair(local_id, peer_id),
            making_offer: AtomicBool::new(false),
            ignore_offer: AtomicBool::new(false),
            pending_ice: Mutex::new(VecDeque::new()),
        }
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    pub fn phase(&self, transport: &dyn PeerTransport) -> SignalingPhase {
        transport.signaling_state().into()
    }

    pub fn is_making_offer(&self) -> bool {
        self.making_offer.load(Ordering::Acquire)
    }

    pub fn is_ignoring_offer(&self) -> bool {
        self.ignore_offer.load(Ordering::Acquire)
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_ice.lock().len()
    }

    /// Creates and sends an offer. Returns false when an offer is already being made
    /// or the connection is mid-negotiation.
    pub async fn negotiate(
        &self,
        transport: &dyn PeerTransport,
        signals: &dyn SignalSink,
    ) -> Result<bool, NegotiationError> {
        if self.making_offer.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let _making = MakingOffer(&self.making_offer);
        if self.phase(transport) != SignalingPhase::Stable {
            return Ok(false);
        }

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        debug!(
            target: "parley::negotiation",
            peer_id = %self.peer_id,
            "sending offer"
        );
        signals
            .send(
                &self.room_id,
                OutgoingMessage::Offer {
                    sdp: offer,
                    to: self.peer_id.clone(),
                },
            )
            .await?;
        Ok(true)
    }

    pub async fn handle_offer(
        &self,
        offer: SessionDescription,
        transport: &dyn PeerTransport,
        signals: &dyn SignalSink,
    ) -> Result<OfferOutcome, NegotiationError> {
        let phase = self.phase(transport);
        let collision = phase != SignalingPhase::Stable || self.is_making_offer();
        let ignore = collision && !self.politeness.is_polite();
        self.ignore_offer.store(ignore, Ordering::Release);
        if ignore {
            debug!(
                target: "parley::negotiation",
                peer_id = %self.peer_id,
                ?phase,
                "ignoring colliding offer"
            );
            return Ok(OfferOutcome::Ignored);
        }

        let mut rolled_back = false;
        if collision && phase == SignalingPhase::AwaitingRemoteAnswer {
            debug!(
                target: "parley::negotiation",
                peer_id = %self.peer_id,
                "rolling back local offer"
            );
            transport
                .set_local_description(SessionDescription::rollback())
                .await?;
            rolled_back = true;
        }

        transport.set_remote_description(offer).await?;
        self.flush_candidates(transport).await;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        debug!(
            target: "parley::negotiation",
            peer_id = %self.peer_id,
            rolled_back,
            "sending answer"
        );
        signals
            .send(
                &self.room_id,
                OutgoingMessage::Answer {
                    sdp: answer,
                    to: self.peer_id.clone(),
                },
            )
            .await?;
        Ok(OfferOutcome::Answered { rolled_back })
    }

    pub async fn handle_answer(
        &self,
        answer: SessionDescription,
        transport: &dyn PeerTransport,
    ) -> Result<(), NegotiationError> {
        transport.set_remote_description(answer).await?;
        self.flush_candidates(transport).await;
        Ok(())
    }

    pub async fn handle_candidate(
        &self,
        candidate: IceCandidate,
        transport: &dyn PeerTransport,
    ) -> Result<CandidateOutcome, NegotiationError> {
        if !transport.has_remote_description().await {
            self.pending_ice.lock().push_back(candidate);
            return Ok(CandidateOutcome::Queued);
        }
        match transport.add_ice_candidate(candidate).await {
            Ok(()) => Ok(CandidateOutcome::Applied),
            Err(err) if self.is_ignoring_offer() => {
                debug!(
                    target: "parley::negotiation",
                    peer_id = %self.peer_id,
                    error = %err,
                    "discarding candidate for ignored offer"
                );
                Ok(CandidateOutcome::Discarded)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn flush_candidates(&self, transport: &dyn PeerTransport) {
        let queued: Vec<IceCandidate> = self.pending_ice.lock().drain(..).collect();
        for candidate in queued {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                warn!(
                    target: "parley::negotiation",
                    peer_id = %self.peer_id,
                    error = %err,
                    "failed to apply queued candidate"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockNetwork, MockTransport};
    use crate::transport::{ConnectionState, PeerTransport};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<OutgoingMessage>>);

    #[async_trait]
    impl SignalSink for Outbox {
        async fn send(&self, _room: &str, message: OutgoingMessage) -> Result<(), RelayError> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    impl Outbox {
        fn take(&self) -> Vec<OutgoingMessage> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    struct Side {
        transport: Arc<MockTransport>,
        negotiator: Negotiator,
        outbox: Outbox,
    }

    fn sides() -> (Arc<MockNetwork>, Side, Side) {
        let network = MockNetwork::new();
        let make = |local: &str, remote: &str| Side {
            transport: MockTransport::new(&network, local, remote),
            negotiator: Negotiator::new("r1", local, remote),
            outbox: Outbox::default(),
        };
        let a = make("a1", "b2");
        let b = make("b2", "a1");
        (network, a, b)
    }

    fn only_offer(messages: Vec<OutgoingMessage>) -> SessionDescription {
        match messages.as_slice() {
            [OutgoingMessage::Offer { sdp, .. }] => sdp.clone(),
            other => panic!("expected one offer, got {other:?}"),
        }
    }

    fn only_answer(messages: Vec<OutgoingMessage>) -> SessionDescription {
        match messages.as_slice() {
            [OutgoingMessage::Answer { sdp, .. }] => sdp.clone(),
            other => panic!("expected one answer, got {other:?}"),
        }
    }

    #[test]
    fn politeness_follows_id_order() {
        assert_eq!(Politeness::for_pair("a1", "b2"), Politeness::Impolite);
        assert_eq!(Politeness::for_pair("b2", "a1"), Politeness::Polite);
    }

    #[tokio::test]
    async fn plain_offer_answer() {
        let (_net, a, b) = sides();
        assert!(
            a.negotiator
                .negotiate(a.transport.as_ref(), &a.outbox)
                .await
                .expect("negotiate")
        );
        let offer = only_offer(a.outbox.take());
        let outcome = b
            .negotiator
            .handle_offer(offer, b.transport.as_ref(), &b.outbox)
            .await
            .expect("offer");
        assert_eq!(outcome, OfferOutcome::Answered { rolled_back: false });
        let answer = only_answer(b.outbox.take());
        a.negotiator
            .handle_answer(answer, a.transport.as_ref())
            .await
            .expect("answer");
        assert_eq!(a.transport.connection_state(), ConnectionState::Connected);
        assert_eq!(b.transport.connection_state(), ConnectionState::Connected);
        assert!(!a.negotiator.is_making_offer());
    }

    #[tokio::test]
    async fn glare_resolves_to_one_exchange() {
        let (_net, a, b) = sides();
        a.negotiator
            .negotiate(a.transport.as_ref(), &a.outbox)
            .await
            .expect("a offers");
        b.negotiator
            .negotiate(b.transport.as_ref(), &b.outbox)
            .await
            .expect("b offers");
        let offer_a = only_offer(a.outbox.take());
        let offer_b = only_offer(b.outbox.take());

        // a1 is impolite: keeps its own offer.
        let outcome = a
            .negotiator
            .handle_offer(offer_b, a.transport.as_ref(), &a.outbox)
            .await
            .expect("a handles");
        assert_eq!(outcome, OfferOutcome::Ignored);
        assert!(a.negotiator.is_ignoring_offer());
        assert!(a.outbox.take().is_empty());

        // b2 is polite: rolls back and answers.
        let outcome = b
            .negotiator
            .handle_offer(offer_a, b.transport.as_ref(), &b.outbox)
            .await
            .expect("b handles");
        assert_eq!(outcome, OfferOutcome::Answered { rolled_back: true });
        let answer = only_answer(b.outbox.take());
        a.negotiator
            .handle_answer(answer, a.transport.as_ref())
            .await
            .expect("a applies answer");

        assert_eq!(a.transport.signaling_state(), SignalingState::Stable);
        assert_eq!(b.transport.signaling_state(), SignalingState::Stable);
        assert_eq!(
            a.transport.answers_created() + b.transport.answers_created(),
            1
        );
        assert_eq!(a.transport.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn negotiate_skips_when_not_stable() {
        let (_net, a, _b) = sides();
        assert!(
            a.negotiator
                .negotiate(a.transport.as_ref(), &a.outbox)
                .await
                .expect("first")
        );
        assert!(
            !a.negotiator
                .negotiate(a.transport.as_ref(), &a.outbox)
                .await
                .expect("second")
        );
        assert_eq!(a.outbox.take().len(), 1);
    }

    struct ClosedSink;

    #[async_trait]
    impl SignalSink for ClosedSink {
        async fn send(&self, _room: &str, _message: OutgoingMessage) -> Result<(), RelayError> {
            Err(RelayError::Closed)
        }
    }

    #[tokio::test]
    async fn failed_offer_clears_making_offer() {
        let (_net, a, _b) = sides();
        let err = a
            .negotiator
            .negotiate(a.transport.as_ref(), &ClosedSink)
            .await
            .expect_err("relay closed");
        assert_eq!(err, NegotiationError::Signal(RelayError::Closed));
        assert!(!a.negotiator.is_making_offer());
    }

    #[tokio::test]
    async fn early_candidates_queue_until_remote_description() {
        let (_net, a, b) = sides();
        let candidates: Vec<IceCandidate> = ["first", "second", "third"]
            .into_iter()
            .map(|name| IceCandidate {
                candidate: format!("candidate:{name}"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .collect();
        for candidate in &candidates {
            let outcome = b
                .negotiator
                .handle_candidate(candidate.clone(), b.transport.as_ref())
                .await
                .expect("queue");
            assert_eq!(outcome, CandidateOutcome::Queued);
        }
        assert_eq!(b.negotiator.pending_candidates(), 3);
        assert!(b.transport.applied_candidates().is_empty());

        a.negotiator
            .negotiate(a.transport.as_ref(), &a.outbox)
            .await
            .expect("offer");
        b.negotiator
            .handle_offer(
                only_offer(a.outbox.take()),
                b.transport.as_ref(),
                &b.outbox,
            )
            .await
            .expect("answer");
        assert_eq!(b.negotiator.pending_candidates(), 0);
        assert_eq!(b.transport.applied_candidates(), candidates);

        let outcome = b
            .negotiator
            .handle_candidate(candidates[0].clone(), b.transport.as_ref())
            .await
            .expect("apply");
        assert_eq!(outcome, CandidateOutcome::Applied);
    }

    #[tokio::test]
    async fn stale_answer_is_an_error() {
        let (_net, a, _b) = sides();
        let err = a
            .negotiator
            .handle_answer(SessionDescription::answer("{}"), a.transport.as_ref())
            .await
            .expect_err("no offer outstanding");
        assert!(matches!(
            err,
            NegotiationError::Transport(TransportError::InvalidState(_))
        ));
    }
}
