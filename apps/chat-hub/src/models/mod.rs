pub mod message;
pub mod room;

pub use message::{MessageKind, NewMessage, StoredMessage};
pub use room::{Room, RoomKind};

pub type UserId = u64;
pub type RoomId = u64;
pub type MessageId = u64;
