use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// Every message type the relay understands, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ChatJoin,
    ChatLeave,
    ChatMessage,
    ChatTyping,
    GenerateRoomId,
    WebRtcOffer,
    WebRtcAnswer,
    WebRtcIceCandidate,
    GeneralError,
    RoomUsers,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ChatJoin => "chat.join",
            MessageType::ChatLeave => "chat.leave",
            MessageType::ChatMessage => "chat.message",
            MessageType::ChatTyping => "chat.typing",
            MessageType::GenerateRoomId => "utils.generateRoomID",
            MessageType::WebRtcOffer => "webrtc.offer",
            MessageType::WebRtcAnswer => "webrtc.answer",
            MessageType::WebRtcIceCandidate => "webrtc.iceCandidate",
            MessageType::GeneralError => "general.error",
            MessageType::RoomUsers => "room.users",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let ty = match value {
            "chat.join" => MessageType::ChatJoin,
            "chat.leave" => MessageType::ChatLeave,
            "chat.message" => MessageType::ChatMessage,
            "chat.typing" => MessageType::ChatTyping,
            "utils.generateRoomID" => MessageType::GenerateRoomId,
            "webrtc.offer" => MessageType::WebRtcOffer,
            "webrtc.answer" => MessageType::WebRtcAnswer,
            "webrtc.iceCandidate" => MessageType::WebRtcIceCandidate,
            "general.error" => MessageType::GeneralError,
            "room.users" => MessageType::RoomUsers,
            _ => return None,
        };
        Some(ty)
    }

    /// Server-originated types never leave a client.
    pub fn is_outgoing(self) -> bool {
        !matches!(self, MessageType::GeneralError | MessageType::RoomUsers)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        default,
        rename = "usernameFragment",
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

/// Closed set of messages a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    JoinRoom,
    LeaveRoom,
    ChatMessage { message: String },
    Typing { typing: bool },
    GenerateRoomId,
    Offer { sdp: SessionDescription, to: String },
    Answer { sdp: SessionDescription, to: String },
    IceCandidate { candidate: IceCandidate, to: String },
}

impl OutgoingMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            OutgoingMessage::JoinRoom => MessageType::ChatJoin,
            OutgoingMessage::LeaveRoom => MessageType::ChatLeave,
            OutgoingMessage::ChatMessage { .. } => MessageType::ChatMessage,
            OutgoingMessage::Typing { .. } => MessageType::ChatTyping,
            OutgoingMessage::GenerateRoomId => MessageType::GenerateRoomId,
            OutgoingMessage::Offer { .. } => MessageType::WebRtcOffer,
            OutgoingMessage::Answer { .. } => MessageType::WebRtcAnswer,
            OutgoingMessage::IceCandidate { .. } => MessageType::WebRtcIceCandidate,
        }
    }

    /// Peer this message is addressed to, for the three `webrtc.*` types.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            OutgoingMessage::Offer { to, .. }
            | OutgoingMessage::Answer { to, .. }
            | OutgoingMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            OutgoingMessage::JoinRoom
            | OutgoingMessage::LeaveRoom
            | OutgoingMessage::GenerateRoomId => Ok(Value::Object(Map::new())),
            OutgoingMessage::ChatMessage { message } => {
                serde_json::to_value(ChatData { message: message.clone() })
            }
            OutgoingMessage::Typing { typing } => serde_json::to_value(TypingData { typing: *typing }),
            OutgoingMessage::Offer { sdp, to } | OutgoingMessage::Answer { sdp, to } => {
                serde_json::to_value(DescriptionData {
                    sdp: sdp.clone(),
                    to: to.clone(),
                })
            }
            OutgoingMessage::IceCandidate { candidate, to } => serde_json::to_value(CandidateData {
                candidate: candidate.clone(),
                to: to.clone(),
            }),
        }
    }
}

/// Messages a client may receive: echoes of the outgoing set plus server-originated types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    Joined,
    Left,
    ChatMessage { message: String },
    Typing { typing: bool },
    RoomIdGenerated { room_id: Option<String> },
    Offer { sdp: SessionDescription, to: String },
    Answer { sdp: SessionDescription, to: String },
    IceCandidate { candidate: IceCandidate, to: String },
    Error { error: String },
    RoomUsers { users: Vec<RoomUser> },
}

impl IncomingMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            IncomingMessage::Joined => MessageType::ChatJoin,
            IncomingMessage::Left => MessageType::ChatLeave,
            IncomingMessage::ChatMessage { .. } => MessageType::ChatMessage,
            IncomingMessage::Typing { .. } => MessageType::ChatTyping,
            IncomingMessage::RoomIdGenerated { .. } => MessageType::GenerateRoomId,
            IncomingMessage::Offer { .. } => MessageType::WebRtcOffer,
            IncomingMessage::Answer { .. } => MessageType::WebRtcAnswer,
            IncomingMessage::IceCandidate { .. } => MessageType::WebRtcIceCandidate,
            IncomingMessage::Error { .. } => MessageType::GeneralError,
            IncomingMessage::RoomUsers { .. } => MessageType::RoomUsers,
        }
    }
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub room: Option<String>,
    pub from: Option<String>,
    pub message: IncomingMessage,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    room: Option<&'a str>,
    data: Value,
}

#[derive(Serialize, Deserialize)]
struct ChatData {
    message: String,
}

#[derive(Serialize, Deserialize)]
struct TypingData {
    typing: bool,
}

#[derive(Serialize, Deserialize)]
struct DescriptionData {
    sdp: SessionDescription,
    to: String,
}

#[derive(Serialize, Deserialize)]
struct CandidateData {
    candidate: IceCandidate,
    to: String,
}

#[derive(Deserialize)]
struct ErrorData {
    error: String,
}

#[derive(Deserialize)]
struct UsersData {
    users: Vec<RoomUser>,
}

#[derive(Deserialize)]
struct RoomIdData {
    #[serde(default, rename = "roomID")]
    room_id: Option<String>,
}

pub fn encode_outgoing(
    room: Option<&str>,
    message: &OutgoingMessage,
) -> Result<Vec<u8>, ProtocolError> {
    let data = message
        .data()
        .map_err(|err| ProtocolError::Serialize(err.to_string()))?;
    let envelope = WireEnvelope {
        kind: message.message_type().as_str(),
        room,
        data,
    };
    serde_json::to_vec(&envelope).map_err(|err| ProtocolError::Serialize(err.to_string()))
}

/// Decodes a relay frame. Text and binary frames carry the same JSON and normalize
/// to the same [`Envelope`].
pub fn decode_incoming(input: impl AsRef<[u8]>) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_slice(input.as_ref())
        .map_err(|err| ProtocolError::MalformedPayload(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::InvalidEnvelopeShape(
            "top level is not an object",
        ));
    };

    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(ProtocolError::InvalidEnvelopeShape("type is not a string")),
        None => return Err(ProtocolError::InvalidEnvelopeShape("missing type")),
    };
    let message_type =
        MessageType::parse(&kind).ok_or(ProtocolError::UnsupportedMessageType(kind))?;

    let room = optional_string(object.remove("room"), "room is not a string")?;
    let from = optional_string(object.remove("from"), "from is not a string")?;
    let data = match object.remove("data") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(data)) => Value::Object(data),
        Some(_) => return Err(ProtocolError::InvalidEnvelopeShape("data is not an object")),
    };

    let message = match message_type {
        MessageType::ChatJoin => IncomingMessage::Joined,
        MessageType::ChatLeave => IncomingMessage::Left,
        MessageType::ChatMessage => {
            let ChatData { message } = typed(data)?;
            IncomingMessage::ChatMessage { message }
        }
        MessageType::ChatTyping => {
            let TypingData { typing } = typed(data)?;
            IncomingMessage::Typing { typing }
        }
        MessageType::GenerateRoomId => {
            let RoomIdData { room_id } = typed(data)?;
            IncomingMessage::RoomIdGenerated { room_id }
        }
        MessageType::WebRtcOffer => {
            let DescriptionData { sdp, to } = typed(data)?;
            IncomingMessage::Offer { sdp, to }
        }
        MessageType::WebRtcAnswer => {
            let DescriptionData { sdp, to } = typed(data)?;
            IncomingMessage::Answer { sdp, to }
        }
        MessageType::WebRtcIceCandidate => {
            let CandidateData { candidate, to } = typed(data)?;
            IncomingMessage::IceCandidate { candidate, to }
        }
        MessageType::GeneralError => {
            let ErrorData { error } = typed(data)?;
            IncomingMessage::Error { error }
        }
        MessageType::RoomUsers => {
            let UsersData { users } = typed(data)?;
            IncomingMessage::RoomUsers { users }
        }
    };

    Ok(Envelope {
        room,
        from,
        message,
    })
}

fn optional_string(
    value: Option<Value>,
    shape_error: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(_) => Err(ProtocolError::InvalidEnvelopeShape(shape_error)),
    }
}

fn typed<T: DeserializeOwned>(data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|err| ProtocolError::MalformedPayload(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_incoming(r#"{"type":"bogus.type","data":{}}"#).expect_err("bogus type");
        assert_eq!(
            err,
            ProtocolError::UnsupportedMessageType("bogus.type".into())
        );
    }

    #[test]
    fn non_json_is_malformed() {
        let err = decode_incoming("not json").expect_err("not json");
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn non_object_top_level_is_invalid_shape() {
        let err = decode_incoming("[1,2,3]").expect_err("array");
        assert!(matches!(err, ProtocolError::InvalidEnvelopeShape(_)));
        let err = decode_incoming(r#""chat.join""#).expect_err("string");
        assert!(matches!(err, ProtocolError::InvalidEnvelopeShape(_)));
    }

    #[test]
    fn text_and_binary_frames_decode_identically() {
        let text = r#"{"type":"room.users","room":"r1","data":{"users":[{"userID":"a1","username":"ann"},{"userID":"b2","username":"bo"}]}}"#;
        let from_text = decode_incoming(text).expect("text frame");
        let from_bytes = decode_incoming(text.as_bytes().to_vec()).expect("binary frame");
        assert_eq!(from_text, from_bytes);
        match from_text.message {
            IncomingMessage::RoomUsers { users } => {
                let ids: Vec<_> = users.iter().map(|u| u.user_id.as_str()).collect();
                assert_eq!(ids, ["a1", "b2"]);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(from_text.room.as_deref(), Some("r1"));
    }

    #[test]
    fn offer_echo_carries_sender_and_recipient() {
        let bytes = encode_outgoing(
            Some("r1"),
            &OutgoingMessage::Offer {
                sdp: SessionDescription::offer("v=0"),
                to: "b2".into(),
            },
        )
        .expect("encode");
        let mut value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["type"], "webrtc.offer");
        assert_eq!(value["data"]["sdp"]["type"], "offer");
        value["from"] = Value::String("a1".into());

        let decoded = decode_incoming(serde_json::to_vec(&value).expect("json")).expect("decode");
        assert_eq!(decoded.from.as_deref(), Some("a1"));
        assert_eq!(
            decoded.message,
            IncomingMessage::Offer {
                sdp: SessionDescription::offer("v=0"),
                to: "b2".into()
            }
        );
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let bytes = encode_outgoing(
            Some("r1"),
            &OutgoingMessage::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:1 1 udp 1 10.0.0.2 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
                to: "b2".into(),
            },
        )
        .expect("encode");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["data"]["candidate"]["sdpMid"], "0");
        assert_eq!(value["data"]["candidate"]["sdpMLineIndex"], 0);
        assert!(value["data"]["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn missing_fields_are_malformed() {
        let err = decode_incoming(r#"{"type":"chat.typing","data":{}}"#).expect_err("no typing");
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
    }

    #[test]
    fn wrongly_typed_envelope_fields_are_invalid_shape() {
        let err = decode_incoming(r#"{"type":"chat.join","room":5}"#).expect_err("room");
        assert!(matches!(err, ProtocolError::InvalidEnvelopeShape(_)));
        let err = decode_incoming(r#"{"type":"chat.join","data":"x"}"#).expect_err("data");
        assert!(matches!(err, ProtocolError::InvalidEnvelopeShape(_)));
        let err = decode_incoming(r#"{"data":{}}"#).expect_err("type");
        assert!(matches!(err, ProtocolError::InvalidEnvelopeShape(_)));
    }

    #[test]
    fn server_types_are_not_outgoing() {
        assert!(!MessageType::GeneralError.is_outgoing());
        assert!(!MessageType::RoomUsers.is_outgoing());
        assert!(MessageType::GenerateRoomId.is_outgoing());
        assert_eq!(
            MessageType::parse("utils.generateRoomID"),
            Some(MessageType::GenerateRoomId)
        );
    }
}
