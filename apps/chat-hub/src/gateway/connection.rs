//! One physical WebSocket connection: its outbound queue and the read/write
//! pump pair that bridges the socket to the hub.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use chat_common::id::{prefix, prefixed_ulid};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time;

use crate::config::ConnectionConfig;
use crate::models::UserId;

use super::events::Frame;
use super::hub::Hub;
use super::session::UserSession;

/// Display fields of a user, snapshotted at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
}

impl UserProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Who is connecting. Supplied by the caller of the upgrade; the hub does
/// not authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectIdentity {
    pub user_id: UserId,
    #[serde(flatten)]
    pub profile: UserProfile,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue is at capacity; the frame was dropped.
    Full,
    /// The connection was already unregistered.
    Closed,
}

/// A registered connection as seen by the hub.
///
/// The outbound sender lives behind a mutex so the hub can close the queue
/// exactly once: `close` takes it, every later push observes `Closed`.
pub struct Connection {
    id: String,
    user_id: UserId,
    profile: UserProfile,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    shutdown: Notify,
}

impl Connection {
    /// Create a connection handle and the receiving end of its outbound
    /// queue (bounded to `capacity`).
    pub fn new(
        user_id: UserId,
        profile: UserProfile,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: prefixed_ulid(prefix::CONNECTION),
            user_id,
            profile,
            outbound: Mutex::new(Some(tx)),
            shutdown: Notify::new(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Enqueue without waiting. A full queue drops the frame.
    pub fn try_push(&self, frame: Frame) -> PushOutcome {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return PushOutcome::Closed;
        };
        match tx.try_send(frame) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => PushOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Close the outbound queue. Returns `false` if it was already closed.
    /// Frames queued before the close are still delivered by the write pump.
    pub(crate) fn close(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Ask the read pump to stop (used when the write side dies first).
    fn signal_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// What a connection's read pump hands every inbound payload to.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, ctx: &ConnectionContext, payload: &str);
}

/// Everything an inbound handler knows about the originating connection.
pub struct ConnectionContext {
    pub connection: Arc<Connection>,
    pub session: Arc<UserSession>,
}

/// Spawn the read and write pumps for an upgraded socket and return.
pub fn spawn_pumps(
    socket: WebSocket,
    ctx: ConnectionContext,
    outbound: mpsc::Receiver<Frame>,
    hub: Hub,
    handler: Arc<dyn InboundHandler>,
    config: ConnectionConfig,
) {
    let (ws_tx, ws_rx) = socket.split();
    tokio::spawn(write_pump(
        ctx.connection.clone(),
        ws_tx,
        outbound,
        config.clone(),
    ));
    tokio::spawn(read_pump(ctx, ws_rx, hub, handler, config));
}

/// Sends the unregister event when the read pump ends, whichever way it ends.
struct UnregisterOnDrop {
    hub: Hub,
    connection: Arc<Connection>,
}

impl Drop for UnregisterOnDrop {
    fn drop(&mut self) {
        self.hub.unregister(self.connection.clone());
    }
}

async fn read_pump(
    ctx: ConnectionContext,
    mut ws_rx: SplitStream<WebSocket>,
    hub: Hub,
    handler: Arc<dyn InboundHandler>,
    config: ConnectionConfig,
) {
    let _unregister = UnregisterOnDrop {
        hub,
        connection: ctx.connection.clone(),
    };
    let conn_id = ctx.connection.id().to_string();

    loop {
        let next = tokio::select! {
            _ = ctx.connection.shutdown.notified() => break,
            next = time::timeout(config.pong_wait, ws_rx.next()) => next,
        };

        match next {
            Err(_elapsed) => {
                tracing::debug!(connection_id = %conn_id, "read timeout, closing connection");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(?e, connection_id = %conn_id, "ws read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                handler.on_message(&ctx, text.as_str()).await;
            }
            Ok(Some(Ok(Message::Binary(bytes)))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handler.on_message(&ctx, text).await,
                Err(_) => {
                    tracing::debug!(connection_id = %conn_id, "dropping non-utf8 binary frame");
                }
            },
            // Pings and pongs only refresh the read deadline.
            Ok(Some(Ok(_))) => continue,
        }
    }
}

async fn write_pump(
    connection: Arc<Connection>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    config: ConnectionConfig,
) {
    let mut ping = time::interval(config.ping_period);
    ping.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Queue closed by the hub: say goodbye and stop.
                    let _ = time::timeout(config.write_wait, ws_tx.send(Message::Close(None))).await;
                    break;
                };
                let batch = write_batch(&mut ws_tx, &mut outbound, frame);
                match time::timeout(config.write_wait, batch).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection.id(), "ws write error");
                        break;
                    }
                    Err(_elapsed) => {
                        tracing::debug!(connection_id = %connection.id(), "ws write timed out");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let sent = time::timeout(config.write_wait, ws_tx.send(Message::Ping(Bytes::new()))).await;
                if !matches!(sent, Ok(Ok(()))) {
                    tracing::debug!(connection_id = %connection.id(), "ping failed");
                    break;
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    connection.signal_shutdown();
}

/// Write `first` plus every frame already waiting in the queue, then flush
/// once.
async fn write_batch(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    outbound: &mut mpsc::Receiver<Frame>,
    first: Frame,
) -> Result<(), axum::Error> {
    ws_tx.feed(Message::Text(first)).await?;
    for _ in 0..outbound.len() {
        match outbound.try_recv() {
            Ok(frame) => ws_tx.feed(Message::Text(frame)).await?,
            Err(_) => break,
        }
    }
    ws_tx.flush().await
}
