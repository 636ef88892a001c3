//! Schema Cache
//!
//! Latest known structural description of each customer database, keyed by
//! `connection_id`. Written only by the success path of a schema refresh;
//! absence means "not yet discovered". The cache survives agent reconnects
//! (the schema is a property of the database, not the session) and is
//! removed on Connection deletion.

use dashmap::DashMap;
use std::time::Duration;

use crate::correlator::{Correlator, Reply, RequestPayload};
use crate::domain::ConnectionId;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::TableSchema;
use crate::session::SessionHandle;
use crate::store::now_unix;

/// Cached structural description of one customer database
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    /// Tables.
    pub tables: Vec<TableSchema>,
    /// Unix seconds at capture
    pub captured_at: i64,
}

impl SchemaSnapshot {
    /// Renders the snapshot as the schema block of an LLM prompt
    #[must_use]
    pub fn to_prompt(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for table in &self.tables {
            let _ = writeln!(
                out,
                "Table {} (approx. {} rows):",
                table.table, table.row_count_estimate
            );
            for column in &table.columns {
                let nullability = if column.nullable { "NULL" } else { "NOT NULL" };
                let _ = writeln!(
                    out,
                    "  - {} {} {nullability}",
                    column.name, column.column_type
                );
            }
        }
        out
    }
}

/// Map of `connection_id` to the latest snapshot
#[derive(Default)]
pub struct SchemaCache {
    entries: DashMap<ConnectionId, SchemaSnapshot>,
}

impl SchemaCache {
    /// Creates an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached snapshot, if the schema has been discovered
    #[must_use]
    pub fn get(&self, connection_id: ConnectionId) -> Option<SchemaSnapshot> {
        self.entries
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Drops the entry; called on Connection deletion
    pub fn remove(&self, connection_id: ConnectionId) {
        self.entries.remove(&connection_id);
    }

    /// Number of cached snapshots
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Round-trips a `schema_refresh` through the agent and replaces the
    /// cache entry with the reply.
    ///
    /// # Errors
    ///
    /// Propagates `agent_unreachable` / `timeout` from the dispatch; the
    /// cache is left untouched on failure.
    pub async fn refresh(
        &self,
        correlator: &Correlator,
        session: &SessionHandle,
        deadline: Duration,
    ) -> GatewayResult<SchemaSnapshot> {
        let reply = correlator
            .dispatch(session, RequestPayload::SchemaRefresh, deadline)
            .await?;
        let Reply::Schema(tables) = reply else {
            return Err(GatewayError::internal(
                "schema refresh answered with a non-schema reply",
            ));
        };
        let snapshot = SchemaSnapshot {
            tables,
            captured_at: now_unix(),
        };
        self.entries
            .insert(session.connection_id(), snapshot.clone());
        Ok(snapshot)
    }

    /// Returns the cached snapshot, refreshing first if none exists
    ///
    /// # Errors
    ///
    /// Propagates refresh failures when the schema is not yet discovered.
    pub async fn ensure(
        &self,
        correlator: &Correlator,
        session: &SessionHandle,
        deadline: Duration,
    ) -> GatewayResult<SchemaSnapshot> {
        if let Some(snapshot) = self.get(session.connection_id()) {
            return Ok(snapshot);
        }
        self.refresh(correlator, session, deadline).await
    }
}
