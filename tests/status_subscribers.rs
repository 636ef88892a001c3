//! Status subscriber endpoint: origin enforcement, ownership filtering,
//! initial snapshots, and transition delivery over a real WebSocket.

mod common;

use common::{AgentSocket, recv_close_code, recv_json, spawn_gateway};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

const GOOD_ORIGIN: &str = "http://localhost:3000";

async fn connect_status(
    gw: &common::TestGateway,
    token: &str,
    origin: &str,
) -> AgentSocket {
    let url = gw.ws_url(&format!("/status/ws?token={token}"));
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", origin.parse().unwrap());
    let (socket, _) = connect_async(request).await.unwrap();
    socket
}

#[tokio::test]
async fn disallowed_origin_closes_with_the_origin_code() {
    let gw = spawn_gateway().await;
    let token = gw.login("alice");
    let mut socket = connect_status(&gw, &token, "http://evil.example.com").await;
    assert_eq!(recv_close_code(&mut socket).await, Some(4403));
}

#[tokio::test]
async fn missing_token_closes_with_the_auth_code() {
    let gw = spawn_gateway().await;
    let url = gw.ws_url("/status/ws");
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", GOOD_ORIGIN.parse().unwrap());
    let (mut socket, _) = connect_async(request).await.unwrap();
    assert_eq!(recv_close_code(&mut socket).await, Some(4401));
}

#[tokio::test]
async fn subscriber_sees_initial_snapshot_then_transitions_for_owned_agents_only() {
    let gw = spawn_gateway().await;
    let alice = gw.login("alice");
    let bob = gw.login("bob");

    let mine = gw.create_connection(&alice, "mine").await;
    let theirs = gw.create_connection(&bob, "theirs").await;

    // Alice's agent is already connected when she subscribes.
    let my_agent_id = mine["agent_id"].as_str().unwrap().to_string();
    let my_key = mine["agent_key"].as_str().unwrap().to_string();
    let my_agent = gw.connect_agent(&my_agent_id, &my_key).await;

    let mut status = connect_status(&gw, &alice, GOOD_ORIGIN).await;
    let snapshot = recv_json(&mut status).await.unwrap();
    assert_eq!(snapshot["type"], "AGENT_STATUS_UPDATE");
    assert_eq!(snapshot["agent_id"], my_agent_id);
    assert_eq!(snapshot["agentConnected"], true);

    // Bob's agent connecting must be invisible to Alice.
    let their_agent_id = theirs["agent_id"].as_str().unwrap().to_string();
    let their_key = theirs["agent_key"].as_str().unwrap().to_string();
    let _their_agent = gw.connect_agent(&their_agent_id, &their_key).await;

    // Alice's agent disconnecting must be visible.
    drop(my_agent);
    let update = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        recv_json(&mut status),
    )
    .await
    .expect("transition delivered")
    .unwrap();
    assert_eq!(update["agent_id"], my_agent_id);
    assert_eq!(update["agentConnected"], false);
}

#[tokio::test]
async fn ownership_set_updates_when_a_connection_is_created_mid_subscription() {
    let gw = spawn_gateway().await;
    let alice = gw.login("alice");

    let mut status = connect_status(&gw, &alice, GOOD_ORIGIN).await;

    // Created after subscription: the recompute must make its events visible.
    let created = gw.create_connection(&alice, "late").await;
    let agent_id = created["agent_id"].as_str().unwrap().to_string();
    let key = created["agent_key"].as_str().unwrap().to_string();
    let _agent = gw.connect_agent(&agent_id, &key).await;

    let update = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        recv_json(&mut status),
    )
    .await
    .expect("up event for the new connection")
    .unwrap();
    assert_eq!(update["agent_id"], agent_id);
    assert_eq!(update["agentConnected"], true);
}
