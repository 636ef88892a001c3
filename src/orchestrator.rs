//! Query Orchestrator
//!
//! Turns a user question into an answer: picks a backend (agent SQL,
//! in-memory SQL over a cached CSV, or the analytic CSV engine), invokes the
//! LLM, gates generated SQL behind the destructive-verb denylist, dispatches,
//! and formats the reply. Failed queries are never retried automatically.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::correlator::{Correlator, Reply, RequestPayload};
use crate::csv::CsvBackend;
use crate::domain::{CellValue, ConnectionId, FileId, TableResult, UserId};
use crate::error::{GatewayError, GatewayResult};
use crate::llm::{LlmClient, RoutingClassification};
use crate::registry::AgentRegistry;
use crate::schema::SchemaCache;
use crate::store::Store;

/// Destructive or state-changing verbs that must never reach an engine
const SQL_DENYLIST: &[&str] = &[
    "drop", "delete", "insert", "update", "alter", "create", "truncate", "grant", "revoke",
    "attach", "detach", "pragma", "vacuum", "replace", "exec", "execute",
];

/// Where a query is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Agent sql.
    AgentSql,
    /// `csv_to_sql_converter` is accepted on input as a legacy alias for
    /// this collapsed route
    #[serde(alias = "csv_to_sql_converter")]
    CsvSql,
    /// Csv analytic.
    CsvAnalytic,
}

/// Caller preference between the two CSV engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvPreference {
    /// Sql.
    Sql,
    /// Analytic.
    Analytic,
}

/// One user question plus its addressing
#[derive(Debug, Clone, Deserialize)]
pub struct QueryInput {
    /// Question.
    pub question: String,
    #[serde(default)]
    /// Connection id.
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    /// File id.
    pub file_id: Option<FileId>,
    #[serde(default)]
    /// Data source.
    pub data_source: Option<DataSource>,
    #[serde(default, rename = "user_preference")]
    /// Preference.
    pub preference: Option<CsvPreference>,
}

/// Final answer returned to the UI
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    /// Answer.
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Sql.
    pub sql: Option<String>,
    /// Columns.
    pub columns: Vec<String>,
    /// Rows.
    pub rows: Vec<Vec<CellValue>>,
    /// Row count.
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Routing.
    pub routing: Option<RoutingClassification>,
}

/// Per-query lifecycle, surfaced through tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    New,
    Routed,
    SchemaRefreshing,
    LlmGenerating,
    Dispatched,
    ResponseReceived,
    LlmSummarizing,
    Done,
}

struct StateTracker {
    state: QueryState,
}

impl StateTracker {
    fn new() -> Self {
        debug!(state = ?QueryState::New, "query state");
        Self {
            state: QueryState::New,
        }
    }

    fn advance(&mut self, next: QueryState) {
        debug!(from = ?self.state, to = ?next, "query state");
        self.state = next;
    }
}

/// Rejects generated SQL containing any denylisted verb.
///
/// The scan is word-wise and case-insensitive over the whole text, so a
/// destructive statement hidden after a semicolon is still caught.
///
/// # Errors
///
/// `unsafe_query` naming the offending verb.
pub fn ensure_safe_sql(sql: &str) -> GatewayResult<()> {
    let lowered = sql.to_ascii_lowercase();
    for word in lowered.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if SQL_DENYLIST.contains(&word) {
            return Err(GatewayError::UnsafeQuery {
                detail: format!("statement contains '{word}'"),
            });
        }
    }
    Ok(())
}

/// The decision procedure for a user question
pub struct QueryOrchestrator {
    store: Store,
    registry: Arc<AgentRegistry>,
    correlator: Arc<Correlator>,
    schema_cache: Arc<SchemaCache>,
    llm: LlmClient,
    csv_sql: Arc<dyn CsvBackend>,
    csv_analytic: Arc<dyn CsvBackend>,
    dispatch_timeout: Duration,
    summary_sample_rows: usize,
}

impl QueryOrchestrator {
    /// Wires the orchestrator to its collaborators
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        registry: Arc<AgentRegistry>,
        correlator: Arc<Correlator>,
        schema_cache: Arc<SchemaCache>,
        llm: LlmClient,
        csv_sql: Arc<dyn CsvBackend>,
        csv_analytic: Arc<dyn CsvBackend>,
        dispatch_timeout: Duration,
        summary_sample_rows: usize,
    ) -> Self {
        Self {
            store,
            registry,
            correlator,
            schema_cache,
            llm,
            csv_sql,
            csv_analytic,
            dispatch_timeout,
            summary_sample_rows,
        }
    }

    /// Answers one question for one user.
    ///
    /// # Errors
    ///
    /// One stable-coded failure on any abort; a failure here never affects
    /// any other in-flight query.
    pub async fn answer(&self, user: &UserId, input: QueryInput) -> GatewayResult<QueryAnswer> {
        let mut tracker = StateTracker::new();
        let (route, classification) = self.route(&input).await?;
        tracker.advance(QueryState::Routed);
        debug!(?route, "query routed");

        let mut answer = match route {
            DataSource::AgentSql => {
                let connection_id = input.connection_id.ok_or(GatewayError::NoDataSource)?;
                self.answer_agent_sql(&mut tracker, user, connection_id, &input.question)
                    .await?
            }
            DataSource::CsvSql => {
                let file_id = input.file_id.ok_or(GatewayError::NoDataSource)?;
                self.answer_csv_sql(&mut tracker, user, file_id, &input.question)
                    .await?
            }
            DataSource::CsvAnalytic => {
                let file_id = input.file_id.ok_or(GatewayError::NoDataSource)?;
                self.answer_csv_analytic(&mut tracker, user, file_id, &input.question)
                    .await?
            }
        };
        answer.routing = classification;
        tracker.advance(QueryState::Done);
        Ok(answer)
    }

    /// Routing decision table, first match wins
    async fn route(
        &self,
        input: &QueryInput,
    ) -> GatewayResult<(DataSource, Option<RoutingClassification>)> {
        if let Some(explicit) = input.data_source {
            return Ok((explicit, None));
        }
        if input.connection_id.is_some() {
            return Ok((DataSource::AgentSql, None));
        }
        if input.file_id.is_some() {
            return match input.preference {
                Some(CsvPreference::Sql) => Ok((DataSource::CsvSql, None)),
                Some(CsvPreference::Analytic) => Ok((DataSource::CsvAnalytic, None)),
                None => {
                    let classification = self.llm.classify(&input.question).await?;
                    let route = match classification.service.as_str() {
                        "csv_analytic" => DataSource::CsvAnalytic,
                        "csv_sql" | "csv_to_sql_converter" => DataSource::CsvSql,
                        other => {
                            warn!(service = other, "unrecognized classifier verdict, using csv_sql");
                            DataSource::CsvSql
                        }
                    };
                    Ok((route, Some(classification)))
                }
            };
        }
        Err(GatewayError::NoDataSource)
    }

    async fn answer_agent_sql(
        &self,
        tracker: &mut StateTracker,
        user: &UserId,
        connection_id: ConnectionId,
        question: &str,
    ) -> GatewayResult<QueryAnswer> {
        let record = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or(GatewayError::NotFound {
                entity: "connection",
            })?;
        if record.owner != *user {
            return Err(GatewayError::NotFound {
                entity: "connection",
            });
        }

        let session = self
            .registry
            .lookup(record.agent_id)
            .ok_or(GatewayError::AgentUnreachable {
                agent_id: record.agent_id,
            })?;

        let snapshot = match self.schema_cache.get(connection_id) {
            Some(snapshot) => snapshot,
            None => {
                tracker.advance(QueryState::SchemaRefreshing);
                self.schema_cache
                    .refresh(&self.correlator, &session, self.dispatch_timeout)
                    .await?
            }
        };

        tracker.advance(QueryState::LlmGenerating);
        let sql = self.llm.generate_sql(&snapshot.to_prompt(), question).await?;
        ensure_safe_sql(&sql)?;

        tracker.advance(QueryState::Dispatched);
        let reply = self
            .correlator
            .dispatch(
                &session,
                RequestPayload::Query { sql: sql.clone() },
                self.dispatch_timeout,
            )
            .await?;
        tracker.advance(QueryState::ResponseReceived);
        let Reply::Table(table) = reply else {
            return Err(GatewayError::internal("query answered with a non-table reply"));
        };

        self.summarize(tracker, question, Some(sql), table).await
    }

    async fn answer_csv_sql(
        &self,
        tracker: &mut StateTracker,
        user: &UserId,
        file_id: FileId,
        question: &str,
    ) -> GatewayResult<QueryAnswer> {
        self.check_file_ownership(user, file_id).await?;
        let description = self.csv_sql.describe(file_id, user).await?;

        tracker.advance(QueryState::LlmGenerating);
        let mut schema_text = description.schema_text;
        if let Some(table_name) = &description.table_name {
            use std::fmt::Write as _;
            let _ = write!(schema_text, "Use exactly the table name {table_name}.");
        }
        let sql = self.llm.generate_sql(&schema_text, question).await?;
        ensure_safe_sql(&sql)?;

        tracker.advance(QueryState::Dispatched);
        let table = self.csv_sql.execute(file_id, user, &sql).await?;
        tracker.advance(QueryState::ResponseReceived);

        self.summarize(tracker, question, Some(sql), table).await
    }

    async fn answer_csv_analytic(
        &self,
        tracker: &mut StateTracker,
        user: &UserId,
        file_id: FileId,
        question: &str,
    ) -> GatewayResult<QueryAnswer> {
        self.check_file_ownership(user, file_id).await?;

        tracker.advance(QueryState::Dispatched);
        let table = self.csv_analytic.execute(file_id, user, question).await?;
        tracker.advance(QueryState::ResponseReceived);

        self.summarize(tracker, question, None, table).await
    }

    async fn check_file_ownership(&self, user: &UserId, file_id: FileId) -> GatewayResult<()> {
        let record = self
            .store
            .get_file(file_id)
            .await?
            .ok_or(GatewayError::NotFound { entity: "file" })?;
        if record.owner == *user {
            Ok(())
        } else {
            Err(GatewayError::NotFound { entity: "file" })
        }
    }

    async fn summarize(
        &self,
        tracker: &mut StateTracker,
        question: &str,
        sql: Option<String>,
        table: TableResult,
    ) -> GatewayResult<QueryAnswer> {
        tracker.advance(QueryState::LlmSummarizing);
        let rendered = table.render_for_prompt(self.summary_sample_rows);
        let answer = self.llm.summarize(question, &rendered).await?;
        Ok(QueryAnswer {
            answer,
            sql,
            columns: table.columns,
            rows: table.rows,
            row_count: table.row_count,
            routing: None,
        })
    }
}

/// Resolves a user's owned agent set; shared by subscription and refresh
///
/// # Errors
///
/// Propagates store read failures.
pub async fn owned_agent_set(
    store: &Store,
    user: &UserId,
) -> GatewayResult<HashSet<crate::domain::AgentId>> {
    Ok(store.owned_agent_ids(user).await?.into_iter().collect())
}
