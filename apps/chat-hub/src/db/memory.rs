//! In-process implementation of the store traits.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chat_common::SnowflakeGenerator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::StoreError;
use crate::models::{MessageId, NewMessage, Room, RoomId, RoomKind, StoredMessage, UserId};

use super::store::{ChatStore, ReadReceiptStore};

struct RoomEntry {
    kind: RoomKind,
    members: HashSet<UserId>,
    /// Room-wide mute, in effect until the given instant.
    muted_until: Option<DateTime<Utc>>,
    last_message_id: Option<MessageId>,
}

#[derive(Default)]
struct Conversation {
    visible: bool,
    last_read: Option<MessageId>,
}

/// DashMap-backed store used by the binary and by tests.
pub struct MemoryStore {
    rooms: DashMap<RoomId, RoomEntry>,
    /// (room, user) -> muted until.
    member_mutes: DashMap<(RoomId, UserId), DateTime<Utc>>,
    /// Unordered pairs (low, high) of users where at least one blocked the other.
    blocks: DashMap<(UserId, UserId), ()>,
    /// (user, room) -> conversation state.
    conversations: DashMap<(UserId, RoomId), Conversation>,
    messages: DashMap<MessageId, StoredMessage>,
    snowflake: SnowflakeGenerator,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            member_mutes: DashMap::new(),
            blocks: DashMap::new(),
            conversations: DashMap::new(),
            messages: DashMap::new(),
            snowflake: SnowflakeGenerator::new(0),
        }
    }

    /// Create (or replace) a room with the given members. Every member gets
    /// a visible conversation.
    pub fn create_room(&self, room_id: RoomId, kind: RoomKind, members: &[UserId]) {
        self.rooms.insert(
            room_id,
            RoomEntry {
                kind,
                members: members.iter().copied().collect(),
                muted_until: None,
                last_message_id: None,
            },
        );
        for &user_id in members {
            self.conversations.entry((user_id, room_id)).or_default().visible = true;
        }
    }

    pub fn remove_member(&self, room_id: RoomId, user_id: UserId) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.members.remove(&user_id);
        }
    }

    pub fn mute_room(&self, room_id: RoomId, until: DateTime<Utc>) {
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.muted_until = Some(until);
        }
    }

    pub fn mute_member(&self, room_id: RoomId, user_id: UserId, until: DateTime<Utc>) {
        self.member_mutes.insert((room_id, user_id), until);
    }

    pub fn block(&self, a: UserId, b: UserId) {
        self.blocks.insert(block_key(a, b), ());
    }

    pub fn hide_conversation(&self, user_id: UserId, room_id: RoomId) {
        if let Some(mut conv) = self.conversations.get_mut(&(user_id, room_id)) {
            conv.visible = false;
        }
    }

    /// Persisted cursor for one conversation, regardless of visibility.
    pub fn persisted_last_read(&self, user_id: UserId, room_id: RoomId) -> Option<MessageId> {
        self.conversations
            .get(&(user_id, room_id))
            .and_then(|c| c.last_read)
    }

    pub fn message(&self, id: MessageId) -> Option<StoredMessage> {
        self.messages.get(&id).map(|m| m.clone())
    }

    pub fn last_message_id(&self, room_id: RoomId) -> Option<MessageId> {
        self.rooms.get(&room_id).and_then(|r| r.last_message_id)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn block_key(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms.get(&room_id).map(|r| Room {
            id: room_id,
            kind: r.kind,
        }))
    }

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self
            .rooms
            .get(&room_id)
            .is_some_and(|r| r.members.contains(&user_id)))
    }

    async fn is_blocked(&self, room_id: RoomId, sender_id: UserId) -> Result<bool, StoreError> {
        let peer = match self.rooms.get(&room_id) {
            Some(room) => room.members.iter().copied().find(|&m| m != sender_id),
            None => return Err(StoreError::NotFound("room")),
        };
        Ok(peer.is_some_and(|peer| self.blocks.contains_key(&block_key(sender_id, peer))))
    }

    async fn mute_reason(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<String>, StoreError> {
        let now = Utc::now();

        if let Some(until) = self.member_mutes.get(&(room_id, user_id)) {
            if *until > now {
                return Ok(Some(format!(
                    "you are muted until {}",
                    until.format("%Y-%m-%d %H:%M:%S")
                )));
            }
        }

        let room = self
            .rooms
            .get(&room_id)
            .ok_or(StoreError::NotFound("room"))?;
        if let Some(until) = room.muted_until.filter(|until| *until > now) {
            return Ok(Some(format!(
                "the room is muted until {}",
                until.format("%Y-%m-%d %H:%M:%S")
            )));
        }

        Ok(None)
    }

    async fn save_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: self.snowflake.generate(),
            room_id: message.room_id,
            sender_id: message.sender_id,
            kind: message.kind,
            content: message.content,
            extra: message.extra,
            created_at: Utc::now(),
        };

        let mut room = self
            .rooms
            .get_mut(&stored.room_id)
            .ok_or(StoreError::NotFound("room"))?;
        room.last_message_id = Some(stored.id);
        drop(room);

        self.messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError> {
        let room = self
            .rooms
            .get(&room_id)
            .ok_or(StoreError::NotFound("room"))?;
        let mut members: Vec<UserId> = room.members.iter().copied().collect();
        members.sort_unstable();
        Ok(members)
    }

    async fn mark_conversations_visible(&self, room_id: RoomId) -> Result<(), StoreError> {
        let members: Vec<UserId> = match self.rooms.get(&room_id) {
            Some(room) => room.members.iter().copied().collect(),
            None => return Err(StoreError::NotFound("room")),
        };
        for user_id in members {
            self.conversations.entry((user_id, room_id)).or_default().visible = true;
        }
        Ok(())
    }
}

#[async_trait]
impl ReadReceiptStore for MemoryStore {
    async fn flush_user_read(
        &self,
        user_id: UserId,
        cursors: &HashMap<RoomId, MessageId>,
    ) -> Result<(), StoreError> {
        for (&room_id, &last_read) in cursors {
            if room_id == 0 || last_read == 0 {
                continue;
            }
            let mut conv = self.conversations.entry((user_id, room_id)).or_default();
            conv.last_read = Some(conv.last_read.map_or(last_read, |old| old.max(last_read)));
        }
        Ok(())
    }

    async fn visible_conversation_last_reads(
        &self,
        user_id: UserId,
    ) -> Result<HashMap<RoomId, MessageId>, StoreError> {
        Ok(self
            .conversations
            .iter()
            .filter(|entry| entry.key().0 == user_id && entry.value().visible)
            .map(|entry| (entry.key().1, entry.value().last_read.unwrap_or(0)))
            .collect())
    }
}
