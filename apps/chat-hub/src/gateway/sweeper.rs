//! Background persistence of read cursors: the per-user reclamation timer
//! armed when a user's last connection goes away, and the periodic sweep
//! that flushes dirty sessions and prunes idle ones.
//!
//! Neither task keeps the hub alive. Both hold weak references and stop
//! once the hub's shared state is gone.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use crate::models::UserId;

use super::hub::{HubEvent, Shared};
use super::session::UserSession;

/// What a reclamation timer found when it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReclaimOutcome {
    /// Nothing left to persist; the session may be evicted.
    Clean,
    /// The user came back before the timer fired.
    Reconnected,
    /// Persisting the cursors failed; the session must be kept.
    FlushFailed,
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub flushed: usize,
    pub failed: usize,
    pub pruned: usize,
}

/// Reclamation timer body. Sleeps for the grace period, persists the
/// session's cursors if the user is still gone, then reports back to the
/// event loop, which makes the final eviction decision.
pub(super) async fn reclaim_after_grace(
    shared: Weak<Shared>,
    events: mpsc::WeakUnboundedSender<HubEvent>,
    user_id: UserId,
    generation: u64,
    grace: Duration,
) {
    time::sleep(grace).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };

    let (online, session) = {
        let reg = shared.registry.read();
        (
            reg.by_user.contains_key(&user_id),
            reg.sessions.get(&user_id).cloned(),
        )
    };

    let outcome = match (online, session) {
        (true, _) => ReclaimOutcome::Reconnected,
        (false, None) => ReclaimOutcome::Clean,
        (false, Some(session)) => {
            match flush_session(&shared, &session).await {
                Flush::Failed => ReclaimOutcome::FlushFailed,
                Flush::Written | Flush::NothingToWrite => ReclaimOutcome::Clean,
            }
        }
    };

    drop(shared);
    if let Some(events) = events.upgrade() {
        let _ = events.send(HubEvent::Reclaim {
            user_id,
            generation,
            outcome,
        });
    }
}

/// Periodic sweep loop; runs until the hub is dropped.
pub(super) async fn run_flush_sweep(shared: Weak<Shared>) {
    let period = match shared.upgrade() {
        Some(shared) => shared.config.flush_interval,
        None => return,
    };
    if period.is_zero() {
        tracing::warn!("flush interval is zero, periodic sweep disabled");
        return;
    }

    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // First tick fires immediately; skip it.

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let report = sweep_once(&shared).await;
        if report != SweepReport::default() {
            tracing::debug!(
                flushed = report.flushed,
                failed = report.failed,
                pruned = report.pruned,
                "flush sweep"
            );
        }
    }
    tracing::debug!("flush sweep stopped");
}

/// One pass over every session: flush the dirty ones, then drop the cursors
/// of those that have been clean and unchanged for the idle window.
pub(super) async fn sweep_once(shared: &Shared) -> SweepReport {
    // Snapshot the list; the registry lock is not held across store I/O.
    let sessions: Vec<Arc<UserSession>> =
        shared.registry.read().sessions.values().cloned().collect();

    let mut report = SweepReport::default();
    for session in sessions {
        match flush_session(shared, &session).await {
            Flush::Written => report.flushed += 1,
            Flush::NothingToWrite => {}
            Flush::Failed => report.failed += 1,
        }
        if session.prune_if_idle(shared.config.idle_prune_after) {
            tracing::debug!(user_id = session.user_id(), "pruned idle read cursors");
            report.pruned += 1;
        }
    }
    report
}

enum Flush {
    Written,
    NothingToWrite,
    /// The session stays dirty.
    Failed,
}

/// Persist the session's cursors if dirty.
async fn flush_session(shared: &Shared, session: &UserSession) -> Flush {
    let Some(snapshot) = session.snapshot_if_dirty() else {
        return Flush::NothingToWrite;
    };
    match shared
        .receipts
        .flush_user_read(session.user_id(), &snapshot.cursors)
        .await
    {
        Ok(()) => {
            session.mark_flushed(snapshot.version);
            Flush::Written
        }
        Err(err) => {
            tracing::warn!(
                ?err,
                user_id = session.user_id(),
                rooms = snapshot.cursors.len(),
                "read cursor flush failed"
            );
            Flush::Failed
        }
    }
}
