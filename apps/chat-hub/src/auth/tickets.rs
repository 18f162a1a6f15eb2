//! Single-use WebSocket upgrade tickets.
//!
//! The embedding application authenticates the user however it likes, then
//! stores a ticket carrying the user's identity. The gateway consumes it on
//! upgrade.

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;
use crate::gateway::connection::ConnectIdentity;

/// WS ticket TTL in seconds.
pub const WS_TICKET_TTL_SECS: u64 = 30;

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

pub fn generate_ws_ticket() -> String {
    generate_opaque_token(chat_common::id::prefix::WS_TICKET, 32)
}

fn ticket_key(ticket: &str) -> String {
    format!("chat:wst:{ticket}")
}

pub async fn store_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
    identity: &ConnectIdentity,
) -> Result<(), ApiError> {
    let value = serde_json::to_string(identity).map_err(|_| ApiError::internal("serialization"))?;
    kv.set_ex(&ticket_key(ticket), &value, WS_TICKET_TTL_SECS)
        .await
        .map_err(ApiError::from)
}

/// Generate, store and return a ticket for `identity`.
pub async fn issue_ws_ticket(
    kv: &dyn KeyValueStore,
    identity: &ConnectIdentity,
) -> Result<String, ApiError> {
    let ticket = generate_ws_ticket();
    store_ws_ticket(kv, &ticket, identity).await?;
    Ok(ticket)
}

/// Look up and delete a ticket. A ticket can be consumed once.
pub async fn consume_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
) -> Result<Option<ConnectIdentity>, ApiError> {
    let key = ticket_key(ticket);
    let val = kv.get(&key).await?;
    if val.is_some() {
        let _ = kv.del(&key).await;
    }
    match val {
        Some(v) => {
            let identity: ConnectIdentity =
                serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt ticket data"))?;
            Ok(Some(identity))
        }
        None => Ok(None),
    }
}
