use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MessageId, RoomId, UserId};

/// Content kind of a chat message, carried on the wire as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MessageKind {
    Text = 1,
    Image = 2,
    Voice = 3,
    Video = 4,
    File = 5,
    Location = 6,
    Quote = 7,
    Mention = 8,
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Text,
            2 => Self::Image,
            3 => Self::Voice,
            4 => Self::Video,
            5 => Self::File,
            6 => Self::Location,
            7 => Self::Quote,
            8 => Self::Mention,
            other => return Err(format!("unknown message type {other}")),
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    /// Optional structured metadata (quote target, mention list, media info).
    pub extra: Option<Value>,
}

/// A message as returned by the store after it was persisted.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub content: String,
    pub extra: Option<Value>,
    pub created_at: DateTime<Utc>,
}
