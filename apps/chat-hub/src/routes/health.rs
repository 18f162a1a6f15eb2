use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub online_users: usize,
    pub sessions: usize,
    pub pending_reclaims: usize,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats();
    Json(HealthResponse {
        status: "ok",
        connections: stats.connections,
        online_users: stats.online_users,
        sessions: stats.sessions,
        pending_reclaims: stats.pending_reclaims,
    })
}
