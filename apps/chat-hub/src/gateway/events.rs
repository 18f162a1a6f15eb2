//! Wire-format messages exchanged over the WebSocket.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::models::{MessageId, MessageKind, RoomId, RoomKind, StoredMessage, UserId};

/// One outbound text frame as queued on a connection. Cloning is cheap, so a
/// single encoded envelope is shared by every recipient of a fan-out.
pub type Frame = Utf8Bytes;

// ---------------------------------------------------------------------------
// Inbound type discriminators
// ---------------------------------------------------------------------------

pub const WS_TYPE_MESSAGE: &str = "message";
pub const WS_TYPE_READ_ACK: &str = "read_ack";

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// The user has read `room_id` up to `last_read_msg_id`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadAck {
    #[serde(alias = "send_to")]
    pub room_id: RoomId,
    pub last_read_msg_id: MessageId,
    #[serde(default, deserialize_with = "packet_id_text")]
    pub packet_id: String,
}

/// Post a message into a room.
///
/// `room_id` is accepted in place of `send_to`; a payload carrying both is
/// malformed.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    #[serde(alias = "room_id")]
    pub send_to: RoomId,
    #[serde(default)]
    pub send_content: String,
    pub send_type: MessageKind,
    #[serde(default)]
    pub extra: Option<Value>,
    #[serde(default, deserialize_with = "packet_id_text")]
    pub packet_id: String,
}

/// A decoded inbound payload.
#[derive(Debug, Clone)]
pub enum Inbound {
    ReadAck(ReadAck),
    Send(SendRequest),
    /// A send without a `type` field, as older clients emit it. Handled
    /// exactly like `Send`; drop this variant once every client tags its
    /// payloads.
    LegacySend(SendRequest),
}

/// First-pass probe: only the discriminator and the correlation id.
#[derive(Deserialize)]
struct Probe {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "packet_id_text")]
    packet_id: String,
}

/// Clients send correlation ids as strings or numbers; either is echoed back
/// as a string. Anything else reads as absent.
fn packet_id_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {source}")]
    Malformed {
        packet_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown message type `{kind}`")]
    UnknownType { packet_id: String, kind: String },
}

impl DecodeError {
    /// Correlation id of the rejected payload, if the client sent one.
    pub fn packet_id(&self) -> &str {
        match self {
            Self::Malformed { packet_id, .. } | Self::UnknownType { packet_id, .. } => packet_id,
        }
    }
}

impl Inbound {
    /// Decode a text frame: probe the `type` field, then decode the body
    /// for that type.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let probe: Probe = serde_json::from_str(text).map_err(|source| DecodeError::Malformed {
            packet_id: String::new(),
            source,
        })?;
        let packet_id = probe.packet_id;
        let malformed = |source| DecodeError::Malformed {
            packet_id: packet_id.clone(),
            source,
        };

        match probe.kind.as_deref() {
            Some(WS_TYPE_READ_ACK) => serde_json::from_str(text)
                .map(Self::ReadAck)
                .map_err(malformed),
            Some(WS_TYPE_MESSAGE) => serde_json::from_str(text)
                .map(Self::Send)
                .map_err(malformed),
            None | Some("") => serde_json::from_str(text)
                .map(Self::LegacySend)
                .map_err(malformed),
            Some(other) => Err(DecodeError::UnknownType {
                packet_id: packet_id.clone(),
                kind: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// A persisted message as fanned out to every room member.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEnvelope {
    pub packet_id: String,
    pub id: MessageId,
    pub room_id: RoomId,
    pub room_type: RoomKind,
    pub sender_id: UserId,
    pub sender_nickname: String,
    pub sender_avatar: String,
    pub msg_type: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(
        message: StoredMessage,
        room_type: RoomKind,
        packet_id: String,
        sender_nickname: String,
        sender_avatar: String,
    ) -> Self {
        Self {
            packet_id,
            id: message.id,
            room_id: message.room_id,
            room_type,
            sender_id: message.sender_id,
            sender_nickname,
            sender_avatar,
            msg_type: message.kind,
            content: message.content,
            extra: message.extra,
            created_at: message.created_at,
        }
    }
}

/// Sent only to the originating user when their payload was rejected.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub message: String,
    pub packet_id: String,
}

/// Every event the server pushes, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(MessageEnvelope),
    Error(ErrorEnvelope),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>, packet_id: impl Into<String>) -> Self {
        Self::Error(ErrorEnvelope {
            message: message.into(),
            packet_id: packet_id.into(),
        })
    }

    /// Serialize into a frame ready to be queued on connections.
    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_read_ack() {
        let inbound = Inbound::decode(
            r#"{"type":"read_ack","room_id":42,"last_read_msg_id":900,"packet_id":"p1"}"#,
        )
        .unwrap();
        match inbound {
            Inbound::ReadAck(ack) => {
                assert_eq!(ack.room_id, 42);
                assert_eq!(ack.last_read_msg_id, 900);
                assert_eq!(ack.packet_id, "p1");
            }
            other => panic!("expected read ack, got {other:?}"),
        }
    }

    #[test]
    fn decodes_tagged_send_with_extra() {
        let inbound = Inbound::decode(
            r#"{"type":"message","send_to":42,"send_content":"hi","send_type":8,"extra":{"mentions":[2]}}"#,
        )
        .unwrap();
        let Inbound::Send(req) = inbound else {
            panic!("expected tagged send");
        };
        assert_eq!(req.send_to, 42);
        assert_eq!(req.send_type, MessageKind::Mention);
        assert_eq!(req.extra.unwrap()["mentions"][0], 2);
        assert!(req.packet_id.is_empty());
    }

    #[test]
    fn untagged_payload_is_legacy_send() {
        let inbound =
            Inbound::decode(r#"{"send_to":42,"send_content":"hi","send_type":1}"#).unwrap();
        assert!(matches!(inbound, Inbound::LegacySend(ref r) if r.send_content == "hi"));
    }

    #[test]
    fn room_id_alias_is_accepted_for_send() {
        let inbound =
            Inbound::decode(r#"{"type":"message","room_id":5,"send_type":2}"#).unwrap();
        assert!(matches!(inbound, Inbound::Send(ref r) if r.send_to == 5));
    }

    #[test]
    fn unknown_type_keeps_packet_id() {
        let err = Inbound::decode(r#"{"type":"typing","packet_id":"abc"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType { ref kind, .. } if kind == "typing"));
        assert_eq!(err.packet_id(), "abc");
    }

    #[test]
    fn malformed_body_keeps_packet_id() {
        let err = Inbound::decode(r#"{"type":"message","send_to":"x","packet_id":"q"}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert_eq!(err.packet_id(), "q");

        let err = Inbound::decode("not json").unwrap_err();
        assert_eq!(err.packet_id(), "");
    }

    #[test]
    fn numeric_packet_id_is_echoed_as_text() {
        let inbound =
            Inbound::decode(r#"{"send_to":42,"send_type":1,"packet_id":123}"#).unwrap();
        assert!(matches!(inbound, Inbound::LegacySend(ref r) if r.packet_id == "123"));

        let err = Inbound::decode(r#"{"type":"typing","packet_id":7}"#).unwrap_err();
        assert_eq!(err.packet_id(), "7");

        let err = Inbound::decode(r#"{"type":"read_ack","packet_id":8}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert_eq!(err.packet_id(), "8");
    }

    #[test]
    fn null_packet_id_reads_as_absent() {
        let inbound = Inbound::decode(
            r#"{"type":"read_ack","room_id":1,"last_read_msg_id":2,"packet_id":null}"#,
        )
        .unwrap();
        assert!(matches!(inbound, Inbound::ReadAck(ref a) if a.packet_id.is_empty()));
    }

    #[test]
    fn send_with_both_room_fields_is_malformed() {
        let err = Inbound::decode(
            r#"{"type":"message","send_to":1,"room_id":1,"send_type":1,"packet_id":"dup"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert_eq!(err.packet_id(), "dup");
    }

    #[test]
    fn invalid_send_type_is_malformed() {
        let err = Inbound::decode(r#"{"send_to":1,"send_type":42}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn error_envelope_shape() {
        let frame = ServerEvent::error("not a member", "p9").encode().unwrap();
        let json: Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "not a member");
        assert_eq!(json["packet_id"], "p9");
    }

    #[test]
    fn message_envelope_shape() {
        let stored = StoredMessage {
            id: 77,
            room_id: 42,
            sender_id: 1,
            kind: MessageKind::Text,
            content: "hi".to_string(),
            extra: None,
            created_at: Utc::now(),
        };
        let event = ServerEvent::Message(MessageEnvelope::new(
            stored,
            RoomKind::Group,
            "p1".to_string(),
            "Al".to_string(),
            String::new(),
        ));
        let json: Value = serde_json::from_str(event.encode().unwrap().as_str()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["id"], 77);
        assert_eq!(json["room_id"], 42);
        assert_eq!(json["room_type"], 2);
        assert_eq!(json["sender_id"], 1);
        assert_eq!(json["msg_type"], 1);
        assert_eq!(json["content"], "hi");
        assert_eq!(json["packet_id"], "p1");
        assert!(json.get("extra").is_none());
        assert!(json["created_at"].is_string());
    }
}
