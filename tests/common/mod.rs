//! Shared test harness: a gateway on an ephemeral port with mock
//! collaborators, plus helpers for driving the HTTP surface and the agent
//! wire protocol.

#![allow(dead_code)]

use custard::auth::StaticIdentityProvider;
use custard::blob::MemoryBlobStore;
use custard::config::GatewayConfig;
use custard::context::{Collaborators, GatewayContext};
use custard::domain::UserId;
use custard::llm::MockLanguageModel;
use custard::server;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestGateway {
    pub addr: SocketAddr,
    pub ctx: Arc<GatewayContext>,
    pub llm: Arc<MockLanguageModel>,
    pub identity: Arc<StaticIdentityProvider>,
    pub blob: Arc<MemoryBlobStore>,
    pub http: reqwest::Client,
}

pub async fn spawn_gateway() -> TestGateway {
    let llm = Arc::new(MockLanguageModel::new());
    let identity = Arc::new(StaticIdentityProvider::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let ctx = GatewayContext::new(
        GatewayConfig::testing(),
        Collaborators {
            llm: llm.clone(),
            identity: identity.clone(),
            blob: blob.clone(),
        },
    )
    .await
    .expect("context should build");

    let (listener, addr) = server::bind(&ctx).await.expect("bind ephemeral port");
    tokio::spawn(server::serve(ctx.clone(), listener));

    TestGateway {
        addr,
        ctx,
        llm,
        identity,
        blob,
        http: reqwest::Client::new(),
    }
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// Registers a bearer token for a user and returns the token
    pub fn login(&self, user: &str) -> String {
        let token = format!("token-{user}");
        self.identity
            .insert_token(token.clone(), UserId::try_new(user.to_string()).unwrap());
        token
    }

    /// Creates a Connection over HTTP; returns the response body
    pub async fn create_connection(&self, token: &str, name: &str) -> serde_json::Value {
        let response = self
            .http
            .post(self.url("/api/v1/connections"))
            .bearer_auth(token)
            .json(&serde_json::json!({"name": name, "db_type": "postgres"}))
            .send()
            .await
            .expect("create connection request");
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        response.json().await.expect("create connection body")
    }

    /// Opens an agent socket and completes the hello handshake
    pub async fn connect_agent(&self, agent_id: &str, agent_key: &str) -> AgentSocket {
        let (mut socket, _) = connect_async(self.ws_url("/agent/ws"))
            .await
            .expect("agent socket connects");
        let hello = serde_json::json!({
            "kind": "hello",
            "agent_id": agent_id,
            "agent_key": agent_key,
        });
        socket
            .send(Message::Text(hello.to_string()))
            .await
            .expect("hello sends");

        let reply = recv_json(&mut socket).await.expect("hello_ok arrives");
        assert_eq!(reply["kind"], "hello_ok");
        socket
    }
}

/// Next JSON text frame, skipping transport noise; None on close/end
pub async fn recv_json(socket: &mut AgentSocket) -> Option<serde_json::Value> {
    loop {
        match socket.next().await? {
            Ok(Message::Text(text)) => {
                return Some(serde_json::from_str(&text).expect("frame is JSON"));
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Waits for the close frame and returns its code
pub async fn recv_close_code(socket: &mut AgentSocket) -> Option<u16> {
    loop {
        match socket.next().await? {
            Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
            Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Next JSON frame of the given kind, skipping heartbeats
pub async fn recv_frame_of_kind(socket: &mut AgentSocket, kind: &str) -> Option<serde_json::Value> {
    loop {
        let frame = recv_json(socket).await?;
        if frame["kind"] == kind {
            return Some(frame);
        }
    }
}

pub async fn send_json(socket: &mut AgentSocket, value: &serde_json::Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("frame sends");
}
