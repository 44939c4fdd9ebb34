use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_proto::{Envelope, OutgoingMessage, ProtocolError, decode_incoming, encode_outgoing};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{RelayError, SignalSink};

struct Participant {
    username: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct RelayState {
    participants: HashMap<String, Participant>,
    rooms: HashMap<String, BTreeSet<String>>,
}

/// In-process relay. Every frame is encoded and decoded with the wire codec, so
/// participants see exactly what a websocket relay would deliver.
#[derive(Default)]
pub struct LocalRelay {
    state: Mutex<RelayState>,
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(
        self: &Arc<Self>,
        user_id: &str,
        username: &str,
    ) -> (Arc<LocalRelayClient>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().participants.insert(
            user_id.to_string(),
            Participant {
                username: username.to_string(),
                tx,
            },
        );
        let client = Arc::new(LocalRelayClient {
            relay: Arc::clone(self),
            user_id: user_id.to_string(),
        });
        (client, rx)
    }

    /// Drops a participant as if its socket closed, updating every room it was in.
    pub fn disconnect(&self, user_id: &str) {
        let rooms: Vec<String> = {
            let mut state = self.state.lock();
            state.participants.remove(user_id);
            state
                .rooms
                .iter_mut()
                .filter_map(|(room, members)| members.remove(user_id).then(|| room.clone()))
                .collect()
        };
        for room in rooms {
            self.publish_members(&room);
        }
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers a raw frame to one participant through the decoder.
    pub fn inject(&self, user_id: &str, raw: &str) -> Result<(), ProtocolError> {
        let envelope = decode_incoming(raw)?;
        if let Some(participant) = self.state.lock().participants.get(user_id) {
            let _ = participant.tx.send(envelope);
        }
        Ok(())
    }

    fn route(&self, from: &str, frame: &[u8]) -> Result<(), RelayError> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|err| ProtocolError::MalformedPayload(err.to_string()))?;
        let kind = value["type"].as_str().unwrap_or_default().to_string();
        let room = value["room"].as_str().unwrap_or_default().to_string();
        let data = value.get("data").cloned().unwrap_or_else(|| json!({}));

        match kind.as_str() {
            "chat.join" => {
                self.state
                    .lock()
                    .rooms
                    .entry(room.clone())
                    .or_default()
                    .insert(from.to_string());
                self.publish_members(&room);
            }
            "chat.leave" => {
                let removed = self
                    .state
                    .lock()
                    .rooms
                    .get_mut(&room)
                    .is_some_and(|members| members.remove(from));
                if removed {
                    self.publish_members(&room);
                }
            }
            "chat.message" | "chat.typing" => {
                let recipients: Vec<String> = self
                    .members(&room)
                    .into_iter()
                    .filter(|member| member != from)
                    .collect();
                let frame = json!({"type": kind, "room": room, "from": from, "data": data});
                for recipient in recipients {
                    self.deliver(&recipient, &frame);
                }
            }
            "utils.generateRoomID" => {
                let frame = json!({
                    "type": kind,
                    "data": {"roomID": Uuid::new_v4().simple().to_string()},
                });
                self.deliver(from, &frame);
            }
            "webrtc.offer" | "webrtc.answer" | "webrtc.iceCandidate" => {
                let to = data["to"].as_str().unwrap_or_default().to_string();
                let frame = json!({"type": kind, "room": room, "from": from, "data": data});
                self.deliver(&to, &frame);
            }
            other => {
                let frame = json!({
                    "type": "general.error",
                    "data": {"error": format!("unsupported message type {other}")},
                });
                self.deliver(from, &frame);
            }
        }
        Ok(())
    }

    fn publish_members(&self, room: &str) {
        let (members, frame) = {
            let state = self.state.lock();
            let members: Vec<String> = state
                .rooms
                .get(room)
                .map(|m| m.iter().cloned().collect())
                .unwrap_or_default();
            let users: Vec<Value> = members
                .iter()
                .map(|id| {
                    let username = state
                        .participants
                        .get(id)
                        .map(|p| p.username.clone())
                        .unwrap_or_default();
                    json!({"userID": id, "username": username})
                })
                .collect();
            (
                members,
                json!({"type": "room.users", "room": room, "data": {"users": users}}),
            )
        };
        for member in members {
            self.deliver(&member, &frame);
        }
    }

    fn deliver(&self, to: &str, frame: &Value) {
        let bytes = match serde_json::to_vec(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(target: "parley::relay", error = %err, "failed to encode relay frame");
                return;
            }
        };
        let envelope = match decode_incoming(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(target: "parley::relay", error = %err, "relay produced undecodable frame");
                return;
            }
        };
        let state = self.state.lock();
        match state.participants.get(to) {
            Some(participant) => {
                let _ = participant.tx.send(envelope);
            }
            None => {
                tracing::debug!(target: "parley::relay", to, "no such participant; dropping frame");
            }
        }
    }
}

/// One participant's handle on a [`LocalRelay`].
pub struct LocalRelayClient {
    relay: Arc<LocalRelay>,
    user_id: String,
}

impl LocalRelayClient {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl SignalSink for LocalRelayClient {
    async fn send(&self, room: &str, message: OutgoingMessage) -> Result<(), RelayError> {
        if !self.relay.state.lock().participants.contains_key(&self.user_id) {
            return Err(RelayError::Closed);
        }
        let frame = encode_outgoing(Some(room), &message)?;
        self.relay.route(&self.user_id, &frame)
    }
}

/// Counts of routed frames by type, for assertions about signaling volume.
pub fn count_by_type(envelopes: &[Envelope]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for envelope in envelopes {
        *counts
            .entry(envelope.message.message_type().as_str())
            .or_insert(0) += 1;
    }
    counts
}
