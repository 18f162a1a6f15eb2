use serde::{Deserialize, Serialize};

use super::RoomId;

/// Whether a room is a one-to-one conversation or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum RoomKind {
    Private = 1,
    Group = 2,
}

impl TryFrom<u8> for RoomKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Private),
            2 => Ok(Self::Group),
            other => Err(format!("unknown room type {other}")),
        }
    }
}

impl From<RoomKind> for u8 {
    fn from(kind: RoomKind) -> Self {
        kind as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub kind: RoomKind,
}
