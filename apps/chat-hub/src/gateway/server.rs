//! WebSocket upgrade handler.

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::auth::tickets;
use crate::error::ApiError;
use crate::AppState;

use super::connection::{spawn_pumps, ConnectIdentity};

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    #[serde(default)]
    pub ticket: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

/// Resolve the caller's identity from a single-use ticket, then upgrade.
/// Missing or unknown tickets are refused before the handshake completes.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = query
        .ticket
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing ticket"))?;

    let identity = tickets::consume_ws_ticket(state.kv.as_ref(), &ticket)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired ticket"))?;

    let max_message_size = state.config.connection.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state, identity)))
}

async fn handle_connection(socket: WebSocket, state: AppState, identity: ConnectIdentity) {
    let user_id = identity.user_id;
    let Some((ctx, outbound)) = state.hub.accept(identity).await else {
        tracing::error!(user_id, "hub is not running, dropping connection");
        return;
    };

    tracing::info!(
        user_id,
        connection_id = %ctx.connection.id(),
        "gateway connection established"
    );

    spawn_pumps(
        socket,
        ctx,
        outbound,
        state.hub.clone(),
        state.router.clone(),
        state.config.connection.clone(),
    );
}
