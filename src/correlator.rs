//! Request/response correlation over multiplexed agent sessions
//!
//! The single abstraction that pairs replies with waiting callers: dispatch
//! allocates a request ID, registers a single-shot sink tagged with the
//! session epoch, enqueues the outbound frame, and parks the caller until a
//! matching reply, the deadline, or session loss resolves it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::{AgentId, RequestId, SessionEpoch, TableResult};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{Frame, TableSchema};
use crate::session::SessionHandle;

/// Payload of one outbound round-trip
#[derive(Debug, Clone)]
pub enum RequestPayload {
    /// Ask the agent for a whole schema snapshot
    SchemaRefresh,
    /// Ask the agent to execute SQL
    /// Query.
    Query {
        /// SQL.
        sql: String,
    },
}

impl RequestPayload {
    fn kind(&self) -> &'static str {
        match self {
            Self::SchemaRefresh => "schema_refresh",
            Self::Query { .. } => "query",
        }
    }

    fn into_frame(self, request_id: RequestId) -> Frame {
        match self {
            Self::SchemaRefresh => Frame::SchemaRefreshRequest { request_id },
            Self::Query { sql } => Frame::QueryRequest { request_id, sql },
        }
    }
}

/// Successful payload of one reply
#[derive(Debug, Clone)]
pub enum Reply {
    /// Whole-schema snapshot
    Schema(Vec<TableSchema>),
    /// Tabular query result
    Table(TableResult),
}

struct Pending {
    agent_id: AgentId,
    epoch: SessionEpoch,
    kind: &'static str,
    sink: oneshot::Sender<GatewayResult<Reply>>,
}

/// Correlates request/response pairs across all live sessions
pub struct Correlator {
    next_id: AtomicU64,
    pending: DashMap<RequestId, Pending>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Creates an empty correlator
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Number of outstanding requests, across all sessions
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn allocate(&self) -> RequestId {
        RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends one request on the given session and parks the caller until a
    /// matching reply arrives, the deadline elapses, or the session is lost.
    ///
    /// A zero deadline fails with `timeout` before any frame is sent. An
    /// enqueue failure (send buffer full, or the session torn down between
    /// lookup and send) retires the sink and fails with `agent_unreachable`.
    /// Dropping the returned future retires the sink quietly; a reply that
    /// arrives afterwards is logged and discarded.
    ///
    /// # Errors
    ///
    /// `timeout`, `agent_unreachable`, or the failure carried by an agent
    /// `error` frame.
    pub async fn dispatch(
        &self,
        session: &SessionHandle,
        payload: RequestPayload,
        deadline: Duration,
    ) -> GatewayResult<Reply> {
        let agent_id = session.agent_id();
        if deadline.is_zero() {
            return Err(GatewayError::Timeout {
                agent_id,
                timeout_ms: 0,
            });
        }

        let request_id = self.allocate();
        let kind = payload.kind();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            Pending {
                agent_id,
                epoch: session.epoch(),
                kind,
                sink: tx,
            },
        );
        // Whatever path resolves this dispatch, the table entry dies with it.
        let _guard = RetireGuard {
            correlator: self,
            request_id,
        };

        let frame = payload.into_frame(request_id);
        if let Err(reason) = session.try_send(frame) {
            debug!(%agent_id, %request_id, kind, %reason, "enqueue failed");
            return Err(GatewayError::AgentUnreachable { agent_id });
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_recv)) => Err(GatewayError::internal(
                "correlation sink closed without a verdict",
            )),
            Err(_elapsed) => Err(GatewayError::Timeout {
                agent_id,
                timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Delivers an inbound reply to its sink.
    ///
    /// Replies for unknown request IDs (late, already timed out, or already
    /// failed) and replies whose session epoch does not match the sink's are
    /// logged and dropped. Returns whether a sink was resolved.
    pub fn complete(
        &self,
        agent_id: AgentId,
        epoch: SessionEpoch,
        request_id: RequestId,
        outcome: GatewayResult<Reply>,
    ) -> bool {
        let matches = self
            .pending
            .get(&request_id)
            .is_some_and(|entry| entry.agent_id == agent_id && entry.epoch == epoch);
        if !matches {
            debug!(%agent_id, %epoch, %request_id, "dropping uncorrelated reply");
            return false;
        }
        // remove() is the single atomic claim; a concurrent fail_session
        // cannot deliver the same sink twice.
        let Some((_, entry)) = self.pending.remove(&request_id) else {
            return false;
        };
        if entry.sink.send(outcome).is_err() {
            debug!(%agent_id, %request_id, kind = entry.kind, "caller gone, reply discarded");
        }
        true
    }

    /// Fails every pending request dispatched on `(agent_id, epoch)`.
    ///
    /// Called by the registry on detach and displacement, before either
    /// returns, so callers observe `agent_unreachable` immediately.
    pub fn fail_session(&self, agent_id: AgentId, epoch: SessionEpoch) {
        let doomed: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.agent_id == agent_id && entry.epoch == epoch)
            .map(|entry| *entry.key())
            .collect();
        for request_id in doomed {
            if let Some((_, entry)) = self.pending.remove(&request_id) {
                warn!(%agent_id, %epoch, %request_id, kind = entry.kind, "failing pending request: session lost");
                let _ = entry
                    .sink
                    .send(Err(GatewayError::AgentUnreachable { agent_id }));
            }
        }
    }

    /// Fails every pending request in the process; shutdown path.
    pub fn fail_all_shutdown(&self) {
        let doomed: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for request_id in doomed {
            if let Some((_, entry)) = self.pending.remove(&request_id) {
                let _ = entry.sink.send(Err(GatewayError::Shutdown));
            }
        }
    }
}

struct RetireGuard<'a> {
    correlator: &'a Correlator,
    request_id: RequestId,
}

impl Drop for RetireGuard<'_> {
    fn drop(&mut self) {
        // No-op when complete()/fail_session() already claimed the entry.
        self.correlator.pending.remove(&self.request_id);
    }
}
