//! Standalone chat-hub server.
//!
//! Serves `/health` and the `/gateway` WebSocket over the in-memory
//! collaborators built by [`AppState::new`]. The binary neither issues
//! upgrade tickets nor creates rooms: an embedding application is expected
//! to do both through `AppState::kv` (see `auth::tickets::issue_ws_ticket`)
//! and `AppState::store`. Run on its own, every upgrade is refused with 401.

use std::net::SocketAddr;
use std::path::Path;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_hub::config::Config;
use chat_hub::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    tracing::info!(
        grace_period_secs = config.hub.grace_period.as_secs(),
        flush_interval_secs = config.hub.flush_interval.as_secs(),
        outbound_capacity = config.hub.outbound_capacity,
        deliver_to_sender = config.router.deliver_to_sender,
        "chat-hub configured"
    );

    let state = AppState::new(config);
    let hub = state.hub.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_hub::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-hub listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Persist whatever read cursors are still only in memory.
    let report = hub.flush_now().await;
    tracing::info!(
        flushed = report.flushed,
        failed = report.failed,
        "read cursors flushed on shutdown"
    );
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
