//! Interfaces of the persistence collaborators the hub depends on.
//!
//! The hub never talks to a database directly. Rooms, memberships, messages
//! and persisted read cursors live behind these traits; `MemoryStore`
//! implements them in-process.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{MessageId, NewMessage, Room, RoomId, StoredMessage, UserId};

/// Room, membership and message persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn room(&self, room_id: RoomId) -> Result<Option<Room>, StoreError>;

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;

    /// For private rooms: whether either participant has blocked the other.
    async fn is_blocked(&self, room_id: RoomId, sender_id: UserId) -> Result<bool, StoreError>;

    /// Mute check. Returns a human-readable reason while the user may not
    /// post in the room, `None` otherwise.
    async fn mute_reason(&self, room_id: RoomId, user_id: UserId)
        -> Result<Option<String>, StoreError>;

    async fn save_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserId>, StoreError>;

    /// Make the room's conversation visible again for every member (a new
    /// message revives hidden conversations).
    async fn mark_conversations_visible(&self, room_id: RoomId) -> Result<(), StoreError>;
}

/// Persistence of per-user read cursors.
#[async_trait]
pub trait ReadReceiptStore: Send + Sync {
    /// Persist `room -> last read message` for a user. Per room the stored
    /// value only ever moves forward.
    async fn flush_user_read(
        &self,
        user_id: UserId,
        cursors: &HashMap<RoomId, MessageId>,
    ) -> Result<(), StoreError>;

    /// Cursors of every visible conversation, loaded when a user connects.
    async fn visible_conversation_last_reads(
        &self,
        user_id: UserId,
    ) -> Result<HashMap<RoomId, MessageId>, StoreError>;
}
