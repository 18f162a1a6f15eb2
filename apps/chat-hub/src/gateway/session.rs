//! Per-user session state shared by every connection of that user.
//!
//! The session owns the in-memory read cursors (`room -> last read message`)
//! and the bookkeeping that decides when they must be persisted and when
//! they can be dropped from memory.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::models::{MessageId, RoomId, UserId};

use super::connection::UserProfile;

/// A copy of the cursor map taken for flushing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSnapshot {
    pub cursors: HashMap<RoomId, MessageId>,
    /// Change counter at the time of the snapshot; handed back to
    /// [`UserSession::mark_flushed`].
    pub version: u64,
}

struct ReadState {
    /// Only rooms with known read activity. Values never decrease.
    cursors: HashMap<RoomId, MessageId>,
    dirty: bool,
    /// Bumped on every applied merge.
    version: u64,
    last_flush: Option<Instant>,
    last_change: Option<Instant>,
}

pub struct UserSession {
    user_id: UserId,
    profile: RwLock<UserProfile>,
    read: Mutex<ReadState>,
}

impl UserSession {
    pub fn new(user_id: UserId, profile: UserProfile) -> Self {
        Self {
            user_id,
            profile: RwLock::new(profile),
            read: Mutex::new(ReadState {
                cursors: HashMap::new(),
                dirty: false,
                version: 0,
                last_flush: None,
                last_change: None,
            }),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn profile(&self) -> UserProfile {
        self.profile.read().clone()
    }

    /// Replace the display fields with those of the newest connection.
    pub fn refresh_profile(&self, profile: UserProfile) {
        *self.profile.write() = profile;
    }

    /// Apply a read acknowledgement. Only a strictly greater message id
    /// moves the cursor; zero ids are ignored. Returns whether the cursor
    /// moved.
    pub fn merge_read(&self, room_id: RoomId, message_id: MessageId) -> bool {
        if room_id == 0 || message_id == 0 {
            return false;
        }
        let now = Instant::now();
        let mut state = self.read.lock();

        let current = state.cursors.get(&room_id).copied().unwrap_or(0);
        if message_id <= current {
            return false;
        }
        state.cursors.insert(room_id, message_id);
        state.dirty = true;
        state.version += 1;
        state.last_change = Some(now);
        true
    }

    /// Load cursors that are already persisted. Values are merged
    /// monotonically like acks but never mark the session dirty.
    pub fn seed(&self, cursors: HashMap<RoomId, MessageId>) {
        let mut state = self.read.lock();
        for (room_id, message_id) in cursors {
            if room_id == 0 || message_id == 0 {
                continue;
            }
            let slot = state.cursors.entry(room_id).or_insert(0);
            if message_id > *slot {
                *slot = message_id;
            }
        }
    }

    /// Copy of the cursor map, `None` when it is empty.
    pub fn snapshot(&self) -> Option<HashMap<RoomId, MessageId>> {
        let state = self.read.lock();
        if state.cursors.is_empty() {
            return None;
        }
        Some(state.cursors.clone())
    }

    /// Copy of the cursor map if it holds unflushed changes. Does not clear
    /// the dirty flag; only [`mark_flushed`](Self::mark_flushed) does.
    pub fn snapshot_if_dirty(&self) -> Option<ReadSnapshot> {
        let state = self.read.lock();
        if !state.dirty || state.cursors.is_empty() {
            return None;
        }
        Some(ReadSnapshot {
            cursors: state.cursors.clone(),
            version: state.version,
        })
    }

    /// Record a successful flush of the snapshot taken at `version`.
    ///
    /// The dirty flag is only cleared if nothing was merged since that
    /// snapshot; otherwise the newer cursors stay pending. Returns whether
    /// the session is clean afterwards.
    pub fn mark_flushed(&self, version: u64) -> bool {
        let now = Instant::now();
        let mut state = self.read.lock();
        state.last_flush = Some(now);
        if state.version != version {
            return false;
        }
        state.dirty = false;
        state.last_change = Some(now);
        true
    }

    /// Drop the cursor map if it is flushed and has been unchanged for at
    /// least `idle`. Returns whether anything was pruned.
    pub fn prune_if_idle(&self, idle: Duration) -> bool {
        if idle.is_zero() {
            return false;
        }
        let mut state = self.read.lock();
        if state.dirty || state.cursors.is_empty() || state.last_flush.is_none() {
            return false;
        }
        match state.last_change {
            Some(changed) if changed.elapsed() >= idle => {
                state.cursors = HashMap::new();
                true
            }
            _ => false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.read.lock().dirty
    }

    pub fn has_cursors(&self) -> bool {
        !self.read.lock().cursors.is_empty()
    }

    pub fn cursor(&self, room_id: RoomId) -> Option<MessageId> {
        self.read.lock().cursors.get(&room_id).copied()
    }
}
