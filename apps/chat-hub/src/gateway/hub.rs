//! The connection hub: single authority over which users and connections
//! are online.
//!
//! All structural changes (register, unregister, broadcast, reclamation)
//! are events consumed one at a time by a single worker task, which is the
//! only writer of the registry. Other tasks read it under a shared lock
//! (fan-out, flush sweep) and never hold that lock across I/O.
//!
//! Delivery is best-effort: a frame is queued on each target connection
//! without waiting, and dropped for any connection whose queue is full.
//! Callers must not assume a pushed frame reaches the client.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::db::store::ReadReceiptStore;
use crate::models::UserId;

use super::connection::{ConnectIdentity, Connection, ConnectionContext, PushOutcome};
use super::events::Frame;
use super::session::UserSession;
use super::sweeper::{self, ReclaimOutcome, SweepReport};

/// Registry state. Written only by [`HubWorker`].
#[derive(Default)]
pub(super) struct Registry {
    /// Every registered connection, by connection id.
    pub(super) connections: HashMap<String, Arc<Connection>>,
    /// Live connections per user, in registration order. A user is present
    /// only while the list is non-empty.
    pub(super) by_user: HashMap<UserId, Vec<Arc<Connection>>>,
    pub(super) sessions: HashMap<UserId, Arc<UserSession>>,
    /// Users with zero connections whose session is awaiting reclamation.
    pub(super) reclaim_timers: HashMap<UserId, ReclaimTimer>,
}

pub(super) struct ReclaimTimer {
    generation: u64,
    task: JoinHandle<()>,
}

pub(super) struct Shared {
    pub(super) registry: RwLock<Registry>,
    pub(super) config: HubConfig,
    pub(super) receipts: Arc<dyn ReadReceiptStore>,
}

pub(super) enum HubEvent {
    Register {
        connection: Arc<Connection>,
        reply: oneshot::Sender<Arc<UserSession>>,
    },
    Unregister(Arc<Connection>),
    Broadcast(Frame),
    Reclaim {
        user_id: UserId,
        generation: u64,
        outcome: ReclaimOutcome,
    },
    Barrier(oneshot::Sender<()>),
}

/// Point-in-time registry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    /// Sum of every user's connection list; always equals `connections`.
    pub user_connections: usize,
    pub online_users: usize,
    pub sessions: usize,
    pub pending_reclaims: usize,
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    /// Start the event loop and the periodic flush sweep on the current
    /// tokio runtime.
    pub fn spawn(config: HubConfig, receipts: Arc<dyn ReadReceiptStore>) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::default()),
            config,
            receipts,
        });

        let worker = HubWorker {
            shared: shared.clone(),
            events: rx,
            events_tx: events.downgrade(),
            next_generation: 0,
        };
        tokio::spawn(worker.run());
        tokio::spawn(sweeper::run_flush_sweep(Arc::downgrade(&shared)));

        Self { shared, events }
    }

    /// Create a connection for `identity`, register it and make sure its
    /// session has cursors loaded. Returns `None` if the hub has stopped.
    pub async fn accept(
        &self,
        identity: ConnectIdentity,
    ) -> Option<(ConnectionContext, mpsc::Receiver<Frame>)> {
        let (connection, outbound) = Connection::new(
            identity.user_id,
            identity.profile,
            self.shared.config.outbound_capacity,
        );
        let session = self.register(connection.clone()).await?;
        self.bootstrap_session(&session).await;
        Some((
            ConnectionContext {
                connection,
                session,
            },
            outbound,
        ))
    }

    /// Load persisted cursors into a session whose cursor map is empty.
    /// Skipped when cursors are already in memory, so rapid reconnects do
    /// not reload them.
    async fn bootstrap_session(&self, session: &UserSession) {
        if session.has_cursors() {
            return;
        }
        match self
            .shared
            .receipts
            .visible_conversation_last_reads(session.user_id())
            .await
        {
            Ok(cursors) => {
                tracing::debug!(
                    user_id = session.user_id(),
                    rooms = cursors.len(),
                    "session cursors loaded"
                );
                session.seed(cursors);
            }
            Err(err) => {
                tracing::warn!(?err, user_id = session.user_id(), "session bootstrap failed");
            }
        }
    }

    /// Register a connection. Resolves to the user's session once the event
    /// loop has processed the registration.
    pub async fn register(&self, connection: Arc<Connection>) -> Option<Arc<UserSession>> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(HubEvent::Register { connection, reply })
            .ok()?;
        rx.await.ok()
    }

    /// Queue an unregistration. Unregistering a connection that is not
    /// registered (or already unregistered) is a no-op.
    pub fn unregister(&self, connection: Arc<Connection>) {
        let _ = self.events.send(HubEvent::Unregister(connection));
    }

    /// Queue `frame` for every live connection. Connections whose queue is
    /// full are unregistered after the pass.
    pub fn broadcast(&self, frame: Frame) {
        let _ = self.events.send(HubEvent::Broadcast(frame));
    }

    /// Best-effort fan-out to every live connection of `user_id`. Never
    /// blocks and never fails: a full queue drops the frame for that
    /// connection only. Returns how many connections accepted the frame.
    pub fn send_to_user(&self, user_id: UserId, frame: Frame) -> usize {
        let targets = self
            .shared
            .registry
            .read()
            .by_user
            .get(&user_id)
            .cloned()
            .unwrap_or_default();

        let mut queued = 0;
        for conn in &targets {
            match conn.try_push(frame.clone()) {
                PushOutcome::Queued => queued += 1,
                PushOutcome::Full => {
                    tracing::debug!(
                        user_id,
                        connection_id = %conn.id(),
                        "outbound queue full, dropping frame"
                    );
                }
                PushOutcome::Closed => {}
            }
        }
        tracing::trace!(user_id, targets = targets.len(), queued, "send_to_user");
        queued
    }

    /// Wait until every event submitted before this call has been processed.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(HubEvent::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Run one flush sweep immediately (also done periodically).
    pub async fn flush_now(&self) -> SweepReport {
        sweeper::sweep_once(&self.shared).await
    }

    pub fn session(&self, user_id: UserId) -> Option<Arc<UserSession>> {
        self.shared.registry.read().sessions.get(&user_id).cloned()
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        self.shared
            .registry
            .read()
            .by_user
            .get(&user_id)
            .map_or(0, Vec::len)
    }

    pub fn is_reclaim_pending(&self, user_id: UserId) -> bool {
        self.shared
            .registry
            .read()
            .reclaim_timers
            .contains_key(&user_id)
    }

    pub fn stats(&self) -> HubStats {
        let reg = self.shared.registry.read();
        HubStats {
            connections: reg.connections.len(),
            user_connections: reg.by_user.values().map(Vec::len).sum(),
            online_users: reg.by_user.len(),
            sessions: reg.sessions.len(),
            pending_reclaims: reg.reclaim_timers.len(),
        }
    }
}

/// Owner of the registry write side.
struct HubWorker {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<HubEvent>,
    /// Handed to reclamation timers; weak so pending timers do not keep the
    /// loop alive.
    events_tx: mpsc::WeakUnboundedSender<HubEvent>,
    next_generation: u64,
}

impl HubWorker {
    async fn run(mut self) {
        tracing::info!("hub event loop started");
        while let Some(event) = self.events.recv().await {
            match event {
                HubEvent::Register { connection, reply } => {
                    let session = self.register(connection);
                    let _ = reply.send(session);
                }
                HubEvent::Unregister(connection) => self.unregister(&connection),
                HubEvent::Broadcast(frame) => self.broadcast(frame),
                HubEvent::Reclaim {
                    user_id,
                    generation,
                    outcome,
                } => self.finish_reclaim(user_id, generation, outcome),
                HubEvent::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }

        let mut reg = self.shared.registry.write();
        for (_, timer) in reg.reclaim_timers.drain() {
            timer.task.abort();
        }
        tracing::info!("hub event loop stopped");
    }

    fn register(&mut self, connection: Arc<Connection>) -> Arc<UserSession> {
        let user_id = connection.user_id();
        let mut reg = self.shared.registry.write();

        let existing = reg.sessions.get(&user_id).cloned();
        let session = match existing {
            Some(existing) => {
                existing.refresh_profile(connection.profile().clone());
                existing
            }
            None => {
                let created = Arc::new(UserSession::new(user_id, connection.profile().clone()));
                reg.sessions.insert(user_id, created.clone());
                created
            }
        };

        if let Some(timer) = reg.reclaim_timers.remove(&user_id) {
            timer.task.abort();
            tracing::debug!(user_id, "reclamation cancelled by reconnect");
        }

        reg.connections
            .insert(connection.id().to_string(), connection.clone());
        let devices = reg.by_user.entry(user_id).or_default();
        devices.push(connection.clone());

        tracing::info!(
            user_id,
            connection_id = %connection.id(),
            devices = devices.len(),
            "connection registered"
        );
        session
    }

    fn unregister(&mut self, connection: &Arc<Connection>) {
        let shared = self.shared.clone();
        let mut reg = shared.registry.write();

        if reg.connections.remove(connection.id()).is_none() {
            return;
        }
        connection.close();

        let user_id = connection.user_id();
        let now_empty = match reg.by_user.get_mut(&user_id) {
            Some(devices) => {
                devices.retain(|c| c.id() != connection.id());
                devices.is_empty()
            }
            None => true,
        };

        tracing::info!(
            user_id,
            connection_id = %connection.id(),
            "connection unregistered"
        );

        if now_empty {
            reg.by_user.remove(&user_id);
            self.arm_reclaim(&mut reg, user_id);
        }
    }

    fn broadcast(&mut self, frame: Frame) {
        let stalled: Vec<Arc<Connection>> = {
            let reg = self.shared.registry.read();
            reg.connections
                .values()
                .filter(|conn| conn.try_push(frame.clone()) == PushOutcome::Full)
                .cloned()
                .collect()
        };

        for conn in &stalled {
            tracing::warn!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                "evicting connection with full outbound queue"
            );
            self.unregister(conn);
        }
    }

    /// Start (or restart) the grace timer for a user with no connections.
    fn arm_reclaim(&mut self, reg: &mut Registry, user_id: UserId) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let task = tokio::spawn(sweeper::reclaim_after_grace(
            Arc::downgrade(&self.shared),
            self.events_tx.clone(),
            user_id,
            generation,
            self.shared.config.grace_period,
        ));

        if let Some(previous) = reg
            .reclaim_timers
            .insert(user_id, ReclaimTimer { generation, task })
        {
            previous.task.abort();
        }
    }

    fn finish_reclaim(&mut self, user_id: UserId, generation: u64, outcome: ReclaimOutcome) {
        let shared = self.shared.clone();
        let mut reg = shared.registry.write();

        // A newer timer or a reconnect superseded this one.
        match reg.reclaim_timers.get(&user_id) {
            Some(timer) if timer.generation == generation => {}
            _ => return,
        }
        reg.reclaim_timers.remove(&user_id);

        if reg.by_user.contains_key(&user_id) {
            return;
        }

        let dirty = reg.sessions.get(&user_id).is_some_and(|s| s.is_dirty());
        if outcome == ReclaimOutcome::FlushFailed || dirty {
            tracing::warn!(user_id, "session not reclaimed, unflushed cursors; retrying later");
            self.arm_reclaim(&mut reg, user_id);
            return;
        }

        reg.sessions.remove(&user_id);
        tracing::info!(user_id, "session reclaimed");
    }
}
