//! Real-time gateway: the connection hub, per-user sessions, the socket
//! pumps and inbound dispatch.

pub mod connection;
pub mod events;
pub mod hub;
pub mod notifier;
pub mod router;
pub mod server;
pub mod session;
pub mod sweeper;

pub use connection::{ConnectIdentity, Connection, ConnectionContext, InboundHandler, UserProfile};
pub use hub::{Hub, HubStats};
pub use notifier::UserNotifier;
pub use router::{MessageRouter, RouteError};
pub use session::UserSession;
pub use sweeper::SweepReport;
