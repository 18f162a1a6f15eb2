mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time;
use tokio_tungstenite::tungstenite;

use chat_hub::config::{Config, ConnectionConfig};
use chat_hub::gateway::events::Frame;
use chat_hub::models::RoomKind;

const ALICE: u64 = 1;
const BOB: u64 = 2;
const CAROL: u64 = 3;

fn assert_unauthorized(result: Result<common::WsStream, tungstenite::Error>) {
    match result {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        Err(other) => panic!("expected HTTP 401, got {other:?}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}

/// One-second read timeout, so pings go out every 900ms.
fn fast_keepalive() -> Config {
    Config {
        connection: ConnectionConfig::with_pong_wait(Duration::from_secs(1)),
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_rejects_missing_or_unknown_ticket() {
    let (addr, state) = common::start_ws_server().await;

    assert_unauthorized(common::try_connect(addr, "").await);
    assert_unauthorized(common::try_connect(addr, "wst_nope").await);
    assert_eq!(state.hub.stats().connections, 0);
}

#[tokio::test]
async fn gateway_ticket_is_single_use() {
    let (addr, state) = common::start_ws_server().await;
    let ticket = common::ticket_for(&state, ALICE, "Al").await;

    let _ws = common::try_connect(addr, &ticket).await.expect("first use");
    assert_unauthorized(common::try_connect(addr, &ticket).await);
}

#[tokio::test]
async fn gateway_send_reaches_every_member_device() {
    let (addr, state) = common::start_ws_server().await;
    state
        .store
        .create_room(42, RoomKind::Group, &[ALICE, BOB]);

    let mut a1 = common::connect_user(addr, &state, ALICE, "Al").await;
    let mut a2 = common::connect_user(addr, &state, ALICE, "Al").await;
    let mut b1 = common::connect_user(addr, &state, BOB, "Bo").await;
    assert_eq!(state.hub.connection_count(ALICE), 2);

    common::send_json(
        &mut a1,
        json!({ "type": "message", "send_to": 42, "send_content": "hi", "send_type": 1, "packet_id": "p1" }),
    )
    .await;

    let mut ids = Vec::new();
    for ws in [&mut a1, &mut a2, &mut b1] {
        let env = common::next_json(ws).await;
        assert_eq!(env["type"], "message");
        assert_eq!(env["room_id"], 42);
        assert_eq!(env["room_type"], 2);
        assert_eq!(env["sender_id"], ALICE);
        assert_eq!(env["sender_nickname"], "Al");
        assert_eq!(env["content"], "hi");
        assert_eq!(env["msg_type"], 1);
        assert_eq!(env["packet_id"], "p1");
        ids.push(env["id"].as_u64().expect("message id"));
    }
    assert!(ids.iter().all(|&id| id == ids[0]));
    assert_eq!(state.store.last_message_id(42), Some(ids[0]));
}

#[tokio::test]
async fn gateway_read_ack_moves_only_the_acking_users_cursor() {
    let (addr, state) = common::start_ws_server().await;
    state
        .store
        .create_room(42, RoomKind::Group, &[ALICE, BOB]);

    let mut a = common::connect_user(addr, &state, ALICE, "Al").await;
    let mut b = common::connect_user(addr, &state, BOB, "Bo").await;

    common::send_json(
        &mut a,
        json!({ "send_to": 42, "send_content": "hi", "send_type": 1 }),
    )
    .await;
    let message_id = common::next_json(&mut b).await["id"].as_u64().unwrap();
    let _ = common::next_json(&mut a).await;

    common::send_json(
        &mut b,
        json!({ "type": "read_ack", "room_id": 42, "last_read_msg_id": message_id }),
    )
    .await;

    let bob = state.hub.session(BOB).expect("bob session");
    common::wait_until(|| bob.cursor(42) == Some(message_id)).await;

    let alice = state.hub.session(ALICE).expect("alice session");
    assert_eq!(alice.cursor(42), Some(message_id));

    // Acks are not echoed to anyone.
    common::expect_silence(&mut a, Duration::from_millis(200)).await;
    common::expect_silence(&mut b, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn gateway_rejected_send_reports_to_sender_only() {
    let (addr, state) = common::start_ws_server().await;
    state
        .store
        .create_room(42, RoomKind::Group, &[ALICE, BOB]);

    let mut b = common::connect_user(addr, &state, BOB, "Bo").await;
    let mut c = common::connect_user(addr, &state, CAROL, "Ca").await;

    common::send_json(
        &mut c,
        json!({ "type": "message", "send_to": 42, "send_content": "let me in", "send_type": 1, "packet_id": "c1" }),
    )
    .await;

    let err = common::next_json(&mut c).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["packet_id"], "c1");
    assert!(!err["message"].as_str().unwrap().is_empty());

    common::expect_silence(&mut b, Duration::from_millis(200)).await;
    assert!(state.store.last_message_id(42).is_none());

    // The connection survives a rejected payload.
    common::send_json(&mut c, json!({ "type": "bogus", "packet_id": "c2" })).await;
    let err = common::next_json(&mut c).await;
    assert_eq!(err["packet_id"], "c2");
}

#[tokio::test]
async fn gateway_disconnect_unregisters_and_keeps_session_for_grace() {
    let (addr, state) = common::start_ws_server().await;
    let mut ws = common::connect_user(addr, &state, ALICE, "Al").await;

    common::send_json(
        &mut ws,
        json!({ "type": "read_ack", "room_id": 5, "last_read_msg_id": 100 }),
    )
    .await;
    let session = state.hub.session(ALICE).expect("session");
    common::wait_until(|| session.cursor(5) == Some(100)).await;

    ws.close(None).await.expect("close");
    common::wait_until(|| state.hub.connection_count(ALICE) == 0).await;
    common::wait_until(|| state.hub.is_reclaim_pending(ALICE)).await;

    // Reconnecting inside the grace window finds the same cursors.
    let _ws = common::connect_user(addr, &state, ALICE, "Al").await;
    let again = state.hub.session(ALICE).expect("session");
    assert_eq!(again.cursor(5), Some(100));
    assert!(!state.hub.is_reclaim_pending(ALICE));
}

#[tokio::test]
async fn gateway_oversized_frame_closes_connection() {
    let (addr, state) = common::start_ws_server().await;
    let mut ws = common::connect_user(addr, &state, ALICE, "Al").await;

    let huge = "x".repeat(state.config.connection.max_message_size * 2);
    let _ = ws
        .send(tungstenite::Message::Text(huge.into()))
        .await;

    common::wait_until(|| state.hub.connection_count(ALICE) == 0).await;
}

#[tokio::test]
async fn gateway_drops_client_that_stops_reading() {
    let (addr, state) = common::start_ws_server_with(fast_keepalive()).await;
    let _ws = common::connect_user(addr, &state, ALICE, "Al").await;

    // Never polled, so no pong ever goes back and the read deadline lapses.
    common::wait_until(|| state.hub.connection_count(ALICE) == 0).await;
    common::wait_until(|| state.hub.is_reclaim_pending(ALICE)).await;
}

#[tokio::test]
async fn gateway_keepalive_holds_polling_client() {
    let (addr, state) = common::start_ws_server_with(fast_keepalive()).await;
    let mut ws = common::connect_user(addr, &state, ALICE, "Al").await;

    let mut pings = 0;
    let _ = time::timeout(Duration::from_millis(3500), async {
        // Reading lets the client answer each ping with a pong.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_ping() {
                pings += 1;
            }
        }
    })
    .await;

    assert!(pings >= 2, "expected several keepalive pings, saw {pings}");
    assert_eq!(state.hub.connection_count(ALICE), 1);
}

#[tokio::test]
async fn gateway_delivers_queued_burst_in_order() {
    let (addr, state) = common::start_ws_server().await;
    let mut ws = common::connect_user(addr, &state, ALICE, "Al").await;

    // Queued back to back, so the write pump picks most of them up in one batch.
    for seq in 0..20 {
        let frame = Frame::from(json!({ "seq": seq }).to_string());
        assert_eq!(state.hub.send_to_user(ALICE, frame), 1);
    }

    for seq in 0..20 {
        assert_eq!(common::next_json(&mut ws).await["seq"], seq);
    }
    common::expect_silence(&mut ws, Duration::from_millis(100)).await;
}
