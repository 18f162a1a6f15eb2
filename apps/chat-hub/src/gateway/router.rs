//! Inbound dispatch: decodes each payload a client sends and turns it into
//! a session update (read acks) or a persisted, fanned-out message (sends).

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RouterConfig;
use crate::db::store::ChatStore;
use crate::error::StoreError;
use crate::models::{NewMessage, Room, RoomId, RoomKind, StoredMessage, UserId};

use super::connection::{ConnectionContext, InboundHandler};
use super::events::{DecodeError, Inbound, MessageEnvelope, ReadAck, SendRequest, ServerEvent};
use super::notifier::UserNotifier;

/// Why an inbound payload was rejected. Reported to the sender only.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("sender is not a member of room {0}")]
    NotMember(RoomId),

    #[error("sender and peer in room {0} have blocked each other")]
    Blocked(RoomId),

    #[error("sender is muted: {0}")]
    Muted(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode outbound event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RouteError {
    /// Text shown to the client in the error envelope. Store and encoding
    /// details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Decode(DecodeError::Malformed { .. }) => "invalid message format".to_string(),
            Self::Decode(DecodeError::UnknownType { kind, .. }) => {
                format!("unknown message type: {kind}")
            }
            Self::RoomNotFound(_) => "room not found".to_string(),
            Self::NotMember(_) => "you are not a member of this room".to_string(),
            Self::Blocked(_) => {
                "message not sent: you have blocked or been blocked by this user".to_string()
            }
            Self::Muted(reason) => reason.clone(),
            Self::Store(_) | Self::Encode(_) => "message could not be sent, please retry".to_string(),
        }
    }

    fn is_internal(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Encode(_))
    }
}

/// The hub's inbound handler.
pub struct MessageRouter {
    store: Arc<dyn ChatStore>,
    notifier: Arc<dyn UserNotifier>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn ChatStore>,
        notifier: Arc<dyn UserNotifier>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Move the sender's own cursor. No fan-out and no store call; the
    /// cursor is persisted later by the flush sweep or on reclamation.
    fn read_ack(&self, ctx: &ConnectionContext, ack: &ReadAck) {
        let moved = ctx.session.merge_read(ack.room_id, ack.last_read_msg_id);
        tracing::trace!(
            user_id = ctx.session.user_id(),
            room_id = ack.room_id,
            last_read_msg_id = ack.last_read_msg_id,
            moved,
            "read ack"
        );
    }

    async fn send(&self, ctx: &ConnectionContext, req: SendRequest) -> Result<(), RouteError> {
        let sender_id = ctx.connection.user_id();
        let room = self
            .store
            .room(req.send_to)
            .await?
            .ok_or(RouteError::RoomNotFound(req.send_to))?;

        self.authorize(&room, sender_id).await?;

        let stored = self
            .store
            .save_message(NewMessage {
                room_id: room.id,
                sender_id,
                kind: req.send_type,
                content: req.send_content,
                extra: req.extra,
            })
            .await?;
        let message_id = stored.id;
        let room_id = room.id;

        // The sender has read their own message.
        ctx.session.merge_read(room_id, message_id);

        // Saved: a resend would duplicate it, so from here on failures are
        // only logged.
        if let Err(err) = self.fan_out(ctx, room, stored, req.packet_id).await {
            tracing::error!(?err, message_id, room_id, sender_id, "message saved but not delivered");
        }
        Ok(())
    }

    async fn fan_out(
        &self,
        ctx: &ConnectionContext,
        room: Room,
        stored: StoredMessage,
        packet_id: String,
    ) -> Result<(), RouteError> {
        let sender_id = ctx.connection.user_id();
        let message_id = stored.id;
        let members = self.store.room_members(room.id).await?;

        if let Err(err) = self.store.mark_conversations_visible(room.id).await {
            tracing::warn!(?err, room_id = room.id, "failed to mark conversations visible");
        }

        let profile = ctx.connection.profile();
        let nickname = if profile.nickname.is_empty() {
            profile.name.clone()
        } else {
            profile.nickname.clone()
        };
        let frame = ServerEvent::Message(MessageEnvelope::new(
            stored,
            room.kind,
            packet_id,
            nickname,
            profile.avatar.clone(),
        ))
        .encode()?;

        let recipients: Vec<_> = members
            .into_iter()
            .filter(|&member| self.config.deliver_to_sender || member != sender_id)
            .collect();
        let delivered = self.notifier.send_to_users(&recipients, &frame);

        tracing::debug!(
            message_id,
            room_id = room.id,
            sender_id,
            recipients = recipients.len(),
            delivered,
            "message fanned out"
        );
        Ok(())
    }

    /// Private rooms reject senders on either side of a block; every room
    /// requires current membership and no active mute.
    async fn authorize(&self, room: &Room, sender_id: UserId) -> Result<(), RouteError> {
        if room.kind == RoomKind::Private && self.store.is_blocked(room.id, sender_id).await? {
            return Err(RouteError::Blocked(room.id));
        }
        if !self.store.is_room_member(room.id, sender_id).await? {
            return Err(RouteError::NotMember(room.id));
        }
        if let Some(reason) = self.store.mute_reason(room.id, sender_id).await? {
            return Err(RouteError::Muted(reason));
        }
        Ok(())
    }

    /// Send an error envelope to the originating user only.
    fn reject(&self, ctx: &ConnectionContext, err: &RouteError, packet_id: &str) {
        let user_id = ctx.connection.user_id();
        if err.is_internal() {
            tracing::error!(?err, user_id, packet_id, "inbound message failed");
        } else {
            tracing::warn!(%err, user_id, packet_id, "inbound message rejected");
        }

        match ServerEvent::error(err.client_message(), packet_id).encode() {
            Ok(frame) => {
                self.notifier.send_to_user(user_id, frame);
            }
            Err(encode_err) => {
                tracing::error!(?encode_err, user_id, "failed to encode error envelope");
            }
        }
    }
}

#[async_trait]
impl InboundHandler for MessageRouter {
    async fn on_message(&self, ctx: &ConnectionContext, payload: &str) {
        let (packet_id, result) = match Inbound::decode(payload) {
            Ok(Inbound::ReadAck(ack)) => {
                self.read_ack(ctx, &ack);
                return;
            }
            Ok(Inbound::Send(req) | Inbound::LegacySend(req)) => {
                let packet_id = req.packet_id.clone();
                (packet_id, self.send(ctx, req).await)
            }
            Err(err) => (err.packet_id().to_string(), Err(err.into())),
        };

        if let Err(err) = result {
            self.reject(ctx, &err, &packet_id);
        }
    }
}
