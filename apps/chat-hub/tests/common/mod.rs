#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use chat_hub::auth::tickets;
use chat_hub::config::Config;
use chat_hub::gateway::{ConnectIdentity, UserProfile};
use chat_hub::models::UserId;
use chat_hub::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build a test AppState with in-memory collaborators and default tunables.
pub fn test_state() -> AppState {
    AppState::new(Config::default())
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background.
pub async fn start_ws_server() -> (SocketAddr, AppState) {
    start_ws_server_with(Config::default()).await
}

/// Same as [`start_ws_server`] with caller-supplied tunables.
pub async fn start_ws_server_with(config: Config) -> (SocketAddr, AppState) {
    let state = AppState::new(config);
    let app = chat_hub::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Store a ticket for `user_id` the way the embedding application would.
pub async fn ticket_for(state: &AppState, user_id: UserId, nickname: &str) -> String {
    let identity = ConnectIdentity {
        user_id,
        profile: UserProfile {
            name: format!("user{user_id}"),
            nickname: nickname.to_string(),
            avatar: format!("https://cdn.test/{user_id}.png"),
        },
    };
    tickets::issue_ws_ticket(state.kv.as_ref(), &identity)
        .await
        .expect("issue ticket")
}

pub async fn try_connect(addr: SocketAddr, ticket: &str) -> Result<WsStream, tungstenite::Error> {
    let url = format!("ws://{addr}/gateway?ticket={ticket}");
    tokio_tungstenite::connect_async(&url)
        .await
        .map(|(ws, _)| ws)
}

/// Connect with a fresh ticket and wait until the hub has registered the
/// new connection.
pub async fn connect_user(
    addr: SocketAddr,
    state: &AppState,
    user_id: UserId,
    nickname: &str,
) -> WsStream {
    let before = state.hub.connection_count(user_id);
    let ticket = ticket_for(state, user_id, nickname).await;
    let ws = try_connect(addr, &ticket).await.expect("ws connect");
    wait_until(|| state.hub.connection_count(user_id) > before).await;
    ws
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(time::Instant::now() < deadline, "condition not met in time");
        time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse frame");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no text frame arrives within `wait`.
pub async fn expect_silence(ws: &mut WsStream, wait: Duration) {
    if let Ok(Some(Ok(tungstenite::Message::Text(text)))) = time::timeout(wait, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}
