use crate::models::UserId;

use super::events::Frame;
use super::hub::Hub;

/// Push access to connected users, for code that must not depend on the
/// hub itself (inbound dispatch, business services).
///
/// Delivery is best-effort and at most once: the frame is queued on every
/// live connection of the user that has room for it, and silently dropped
/// for the rest. Nothing is retained for offline users.
pub trait UserNotifier: Send + Sync {
    /// Returns how many connections accepted the frame.
    fn send_to_user(&self, user_id: UserId, frame: Frame) -> usize;

    fn send_to_users(&self, user_ids: &[UserId], frame: &Frame) -> usize {
        user_ids
            .iter()
            .map(|&user_id| self.send_to_user(user_id, frame.clone()))
            .sum()
    }
}

impl UserNotifier for Hub {
    fn send_to_user(&self, user_id: UserId, frame: Frame) -> usize {
        Hub::send_to_user(self, user_id, frame)
    }
}
