//! Agent Session Endpoint
//!
//! One long-lived WebSocket per connector agent. The first inbound frame
//! must be an authenticated `hello`; after that the session runs two sibling
//! tasks: a writer draining the bounded outbound queue (and emitting
//! heartbeats when idle) and a reader demultiplexing inbound frames in
//! arrival order into the correlator.

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HEARTBEAT_MISS_LIMIT;
use crate::context::GatewayContext;
use crate::correlator::Reply;
use crate::domain::{AgentId, AgentKey, ConnectionId, SessionEpoch, TableResult};
use crate::error::GatewayError;
use crate::protocol::{Frame, close};

/// Why a session was closed; determines the close code on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Displaced by a newer authenticated session for the same agent
    Superseded,
    /// Gateway shutdown
    Shutdown,
    /// No inbound frame for three heartbeat intervals
    HeartbeatMiss,
    /// Inbound frame could not be parsed
    Malformed,
    /// Peer closed the transport
    TransportClosed,
}

impl CloseReason {
    /// WebSocket close code sent to the agent
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Superseded => close::SUPERSEDED,
            Self::Shutdown => close::SHUTDOWN,
            Self::HeartbeatMiss => close::HEARTBEAT_MISS,
            Self::Malformed => close::MALFORMED,
            Self::TransportClosed => 1000,
        }
    }

    /// Human-readable close reason
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
            Self::HeartbeatMiss => "heartbeat miss",
            Self::Malformed => "malformed frame",
            Self::TransportClosed => "closed",
        }
    }
}

/// Failure to enqueue an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Bounded buffer is full; the agent is not draining
    BufferFull,
    /// Session already torn down
    Closed,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BufferFull => f.write_str("outbound buffer full"),
            Self::Closed => f.write_str("session closed"),
        }
    }
}

/// Send handle for one live agent session.
///
/// The registry owns the canonical copy; the correlator and endpoint tasks
/// hold clones. Identity is `(agent_id, epoch)`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    agent_id: AgentId,
    connection_id: ConnectionId,
    epoch: SessionEpoch,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
}

impl SessionHandle {
    /// Creates a handle and the receiving half of its outbound queue
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        connection_id: ConnectionId,
        epoch: SessionEpoch,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(queue_capacity);
        (
            Self {
                agent_id,
                connection_id,
                epoch,
                outbound,
                cancel: CancellationToken::new(),
                close_reason: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }

    /// Handle with fresh identities, for exercising the correlator directly
    #[doc(hidden)]
    #[must_use]
    pub fn for_tests(queue_capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        Self::new(
            AgentId::generate(),
            ConnectionId::generate(),
            SessionEpoch::new(1),
            queue_capacity,
        )
    }

    /// Transport identity
    #[must_use]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// The Connection this session authenticated as
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Session generation for this agent
    #[must_use]
    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    /// Enqueues one outbound frame without blocking.
    ///
    /// # Errors
    ///
    /// [`SendFailure::BufferFull`] when the bounded buffer is full,
    /// [`SendFailure::Closed`] when the session is torn down.
    pub fn try_send(&self, frame: Frame) -> Result<(), SendFailure> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendFailure::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Marks the session closed with a reason; idempotent, first reason wins
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.get_or_insert(reason);
        }
        self.cancel.cancel();
    }

    /// Resolves once the session has been closed
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the session has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The first close reason recorded, if any
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self
            .close_reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// `GET /agent/ws`: upgrades and runs one agent session to completion
#[allow(clippy::unused_async)] // axum handlers must be async
pub async fn agent_ws_handler(
    State(ctx): State<Arc<GatewayContext>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_agent_session(ctx, socket))
}

async fn run_agent_session(ctx: Arc<GatewayContext>, socket: WebSocket) {
    if ctx.is_shutting_down() {
        close_now(socket, CloseReason::Shutdown).await;
        return;
    }

    let handshake_deadline = ctx.config.handshake_timeout_ms.as_duration();
    let Some((agent_id, connection_id, socket)) =
        handshake(&ctx, socket, handshake_deadline).await
    else {
        return;
    };

    let (handle, outbound_rx) = ctx
        .registry
        .attach(agent_id, connection_id, ctx.config.session_queue_capacity.as_usize());
    let epoch = handle.epoch();
    // Acked through the ordered outbound queue, so the agent observes the
    // handshake only once the session is attached and routable.
    let _ = handle.try_send(Frame::HelloOk);
    info!(%agent_id, %epoch, "agent session attached");

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(session_writer(
        ws_tx,
        outbound_rx,
        handle.clone(),
        ctx.config.heartbeat_interval.as_duration(),
    ));

    session_reader(&ctx, &handle, ws_rx).await;

    // Reader done: tear down whichever sibling is still up, then detach.
    if !handle.is_closed() {
        handle.close(CloseReason::TransportClosed);
    }
    let _ = writer.await;
    ctx.registry.detach(agent_id, epoch);
    info!(%agent_id, %epoch, reason = handle.close_reason().map_or("closed", CloseReason::as_str), "agent session detached");
}

/// Authenticates the first frame. Consumes and closes the socket on failure.
async fn handshake(
    ctx: &GatewayContext,
    mut socket: WebSocket,
    deadline: Duration,
) -> Option<(AgentId, ConnectionId, WebSocket)> {
    let first = tokio::time::timeout(deadline, socket.recv()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        close_now(socket, CloseReason::Malformed).await;
        return None;
    };
    let Ok(Frame::Hello { agent_id, agent_key }) = serde_json::from_str::<Frame>(&text) else {
        close_now(socket, CloseReason::Malformed).await;
        return None;
    };

    let record = match ctx.store.get_connection_by_agent(agent_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(%agent_id, "handshake from unknown agent");
            close_with_code(socket, close::UNAUTHORIZED).await;
            return None;
        }
        Err(err) => {
            warn!(%agent_id, error = %err, "store unavailable during handshake");
            close_now(socket, CloseReason::Shutdown).await;
            return None;
        }
    };
    if !AgentKey::from_presented(agent_key).matches_digest(&record.agent_key_digest) {
        warn!(%agent_id, "handshake key mismatch");
        close_with_code(socket, close::UNAUTHORIZED).await;
        return None;
    }
    Some((agent_id, record.connection_id, socket))
}

/// Drains the outbound queue onto the socket; emits heartbeats when idle;
/// sends the close frame when the session is cancelled.
async fn session_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    handle: SessionHandle,
    heartbeat_interval: Duration,
) {
    let mut last_sent = Instant::now();
    loop {
        tokio::select! {
            () = handle.cancelled() => {
                let reason = handle.close_reason().unwrap_or(CloseReason::TransportClosed);
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: reason.code(),
                        reason: reason.as_str().into(),
                    })))
                    .await;
                break;
            }
            maybe_frame = outbound.recv() => {
                let Some(frame) = maybe_frame else { break };
                let Ok(json) = serde_json::to_string(&frame) else { continue };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    handle.close(CloseReason::TransportClosed);
                    break;
                }
                last_sent = Instant::now();
            }
            () = tokio::time::sleep_until(last_sent + heartbeat_interval) => {
                let Ok(json) = serde_json::to_string(&Frame::Heartbeat) else { continue };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    handle.close(CloseReason::TransportClosed);
                    break;
                }
                last_sent = Instant::now();
            }
        }
    }
}

/// Demultiplexes inbound frames in arrival order until the session ends
async fn session_reader(
    ctx: &GatewayContext,
    handle: &SessionHandle,
    mut ws_rx: SplitStream<WebSocket>,
) {
    let liveness = ctx.config.heartbeat_interval.as_duration() * HEARTBEAT_MISS_LIMIT;
    loop {
        let message = tokio::select! {
            () = handle.cancelled() => return,
            received = tokio::time::timeout(liveness, ws_rx.next()) => received,
        };
        match message {
            Err(_elapsed) => {
                handle.close(CloseReason::HeartbeatMiss);
                return;
            }
            Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => {
                handle.close(CloseReason::TransportClosed);
                return;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                    warn!(agent_id = %handle.agent_id(), "malformed frame, closing session");
                    handle.close(CloseReason::Malformed);
                    return;
                };
                demux_frame(ctx, handle, frame);
            }
            // Binary frames are not part of the protocol; pings are handled
            // by the transport layer.
            Ok(Some(Ok(_other))) => {}
        }
    }
}

fn demux_frame(ctx: &GatewayContext, handle: &SessionHandle, frame: Frame) {
    let agent_id = handle.agent_id();
    let epoch = handle.epoch();
    match frame {
        Frame::Heartbeat => {}
        Frame::SchemaRefreshResponse { request_id, schema } => {
            ctx.correlator
                .complete(agent_id, epoch, request_id, Ok(Reply::Schema(schema)));
        }
        Frame::QueryResponse {
            request_id,
            columns,
            rows,
            row_count,
        } => {
            ctx.correlator.complete(
                agent_id,
                epoch,
                request_id,
                Ok(Reply::Table(TableResult {
                    columns,
                    rows,
                    row_count,
                })),
            );
        }
        Frame::Error {
            request_id: Some(request_id),
            code,
            message,
        } => {
            ctx.correlator.complete(
                agent_id,
                epoch,
                request_id,
                Err(GatewayError::AgentError { code, message }),
            );
        }
        Frame::Error {
            request_id: None,
            code,
            message,
        } => {
            warn!(%agent_id, code, message, "agent reported session-level error");
        }
        unexpected @ (Frame::Hello { .. }
        | Frame::HelloOk
        | Frame::SchemaRefreshRequest { .. }
        | Frame::QueryRequest { .. }) => {
            debug!(%agent_id, ?unexpected, "ignoring frame kind not valid agent → gateway");
        }
    }
}

async fn close_now(socket: WebSocket, reason: CloseReason) {
    close_with_code_and_reason(socket, reason.code(), reason.as_str()).await;
}

async fn close_with_code(socket: WebSocket, code: u16) {
    close_with_code_and_reason(socket, code, "").await;
}

async fn close_with_code_and_reason(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reasons_map_to_distinct_codes() {
        let reasons = [
            CloseReason::Superseded,
            CloseReason::Shutdown,
            CloseReason::HeartbeatMiss,
            CloseReason::Malformed,
            CloseReason::TransportClosed,
        ];
        let codes: std::collections::HashSet<u16> =
            reasons.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), reasons.len());
    }

    #[test]
    fn first_close_reason_wins() {
        let (handle, _rx) = SessionHandle::for_tests(4);
        handle.close(CloseReason::Superseded);
        handle.close(CloseReason::TransportClosed);
        assert_eq!(handle.close_reason(), Some(CloseReason::Superseded));
        assert!(handle.is_closed());
    }

    #[test]
    fn try_send_reports_full_and_closed_distinctly() {
        let (handle, rx) = SessionHandle::for_tests(1);
        handle.try_send(Frame::Heartbeat).unwrap();
        assert_eq!(handle.try_send(Frame::Heartbeat), Err(SendFailure::BufferFull));

        drop(rx);
        assert_eq!(handle.try_send(Frame::Heartbeat), Err(SendFailure::Closed));
    }
}
