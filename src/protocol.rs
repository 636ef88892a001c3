//! Agent wire protocol
//!
//! One JSON object per WebSocket text frame, discriminated by `kind`. This
//! is the compatibility surface shared with deployed connector agents; field
//! names here are frozen.

use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, CellValue, RequestId};

/// WebSocket close codes used on the agent and status sockets
pub mod close {
    /// Frame could not be parsed; only the offending session is closed
    pub const MALFORMED: u16 = 4400;
    /// Handshake credential mismatch
    pub const UNAUTHORIZED: u16 = 4401;
    /// Origin header rejected on the status socket
    pub const ORIGIN_REJECTED: u16 = 4403;
    /// No inbound frame for three heartbeat intervals
    pub const HEARTBEAT_MISS: u16 = 4408;
    /// Displaced by a newer authenticated session for the same agent
    pub const SUPERSEDED: u16 = 4409;
    /// Gateway shutdown (standard "going away")
    pub const SHUTDOWN: u16 = 1001;
}

/// One frame on the agent wire, either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame of every session, agent → gateway
    Hello {
        /// Agent id.
        agent_id: AgentId,
        /// Agent key.
        agent_key: String,
    },
    /// Handshake acknowledgement, gateway → agent
    HelloOk,
    /// Gateway asks for a whole schema snapshot
    /// Schema refresh request.
    SchemaRefreshRequest {
        /// Request id.
        request_id: RequestId,
    },
    /// Agent returns the snapshot
    SchemaRefreshResponse {
        /// Request id.
        request_id: RequestId,
        /// Schema.
        schema: Vec<TableSchema>,
    },
    /// Gateway dispatches SQL
    /// Query request.
    QueryRequest {
        /// Request id.
        request_id: RequestId,
        /// SQL.
        sql: String,
    },
    /// Agent returns a tabular result
    QueryResponse {
        /// Request id.
        request_id: RequestId,
        /// Columns.
        columns: Vec<String>,
        /// Rows.
        rows: Vec<Vec<CellValue>>,
        /// Row count.
        row_count: usize,
    },
    /// Structured failure, agent → gateway
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        /// Request id.
        request_id: Option<RequestId>,
        /// Code.
        code: String,
        /// Message.
        message: String,
    },
    /// Liveness probe, either direction
    Heartbeat,
}

impl Frame {
    /// The request this frame correlates to, if any
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::SchemaRefreshRequest { request_id }
            | Self::SchemaRefreshResponse { request_id, .. }
            | Self::QueryRequest { request_id, .. }
            | Self::QueryResponse { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            Self::Hello { .. } | Self::HelloOk | Self::Heartbeat => None,
        }
    }
}

/// Wire description of one table in a schema snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table.
    pub table: String,
    /// Columns.
    pub columns: Vec<ColumnSchema>,
    /// Row count estimate.
    pub row_count_estimate: i64,
}

/// Wire description of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Name.
    pub name: String,
    #[serde(rename = "type")]
    /// Column type.
    pub column_type: String,
    /// Nullable.
    pub nullable: bool,
}
