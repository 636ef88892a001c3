//! CSV-to-SQL Session Pool
//!
//! Keyed pool of ephemeral in-memory relational tables, one private SQLite
//! database per admitted file. Admission enforces three scalar caps
//! (per-file source bytes, per-file footprint, aggregate footprint) with LRU
//! eviction under aggregate pressure. All fetch/parse/load work happens
//! outside the pool lock; the lock covers only map mutation.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::{CsvBackend, CsvColumnType, CsvDescription, ParsedCsv, bound_table_name, parse_csv, quote_identifier};
use crate::blob::BlobStore;
use crate::domain::{ByteCap, CellValue, FileId, TableResult, UserId};
use crate::error::{GatewayError, GatewayResult};

/// One materialized CSV: a private in-memory database holding one table
pub struct CsvSession {
    file_id: FileId,
    owner: UserId,
    table_name: String,
    columns: Vec<(String, CsvColumnType)>,
    row_count: usize,
    footprint: u64,
    db: SqlitePool,
}

impl CsvSession {
    /// Bound table name the LLM is told to reference
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Approximate in-memory footprint in bytes
    #[must_use]
    pub fn footprint(&self) -> u64 {
        self.footprint
    }

    /// Schema text for the LLM prompt
    #[must_use]
    pub fn schema_text(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "Table {} ({} rows):", self.table_name, self.row_count);
        for (name, column_type) in &self.columns {
            let _ = writeln!(out, "  - {name} {}", column_type.sql_name());
        }
        out
    }

    /// Materializes a parsed CSV into a fresh private database
    async fn load(file_id: FileId, owner: UserId, parsed: ParsedCsv) -> GatewayResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(GatewayError::Storage)?;
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let table_name = bound_table_name(file_id);
        let column_defs: Vec<String> = parsed
            .headers
            .iter()
            .zip(&parsed.column_types)
            .map(|(name, column_type)| {
                format!("{} {}", quote_identifier(name), column_type.sql_name())
            })
            .collect();
        let ddl = format!(
            "CREATE TABLE {} ({})",
            quote_identifier(&table_name),
            column_defs.join(", ")
        );
        sqlx::query(&ddl).execute(&db).await?;

        let placeholders = vec!["?"; parsed.headers.len()].join(", ");
        let insert_sql = format!(
            "INSERT INTO {} VALUES ({placeholders})",
            quote_identifier(&table_name)
        );
        let mut tx = db.begin().await?;
        for row in &parsed.rows {
            let mut query = sqlx::query(&insert_sql);
            for (cell, column_type) in row.iter().zip(&parsed.column_types) {
                query = match column_type {
                    CsvColumnType::Integer => {
                        query.bind(if cell.is_empty() { None } else { cell.parse::<i64>().ok() })
                    }
                    CsvColumnType::Real => {
                        query.bind(if cell.is_empty() { None } else { cell.parse::<f64>().ok() })
                    }
                    CsvColumnType::Text => query.bind(if cell.is_empty() {
                        None
                    } else {
                        Some(cell.clone())
                    }),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        let footprint = parsed.footprint();
        Ok(Self {
            file_id,
            owner,
            table_name,
            columns: parsed
                .headers
                .into_iter()
                .zip(parsed.column_types)
                .collect(),
            row_count: parsed.rows.len(),
            footprint,
            db,
        })
    }

    /// Runs one SELECT against the session's private table
    async fn run_sql(&self, sql: &str) -> GatewayResult<TableResult> {
        let rows = sqlx::query(sql).fetch_all(&self.db).await?;
        let columns: Vec<String> = rows.first().map_or_else(Vec::new, |row| {
            row.columns().iter().map(|c| c.name().to_string()).collect()
        });
        let mut result_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let cells: Vec<CellValue> = (0..row.columns().len())
                .map(|index| decode_cell(row, index))
                .collect();
            result_rows.push(cells);
        }
        let row_count = result_rows.len();
        Ok(TableResult {
            columns,
            rows: result_rows,
            row_count,
        })
    }
}

fn decode_cell(row: &SqliteRow, index: usize) -> CellValue {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map_or(CellValue::Null, CellValue::Int);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map_or(CellValue::Null, CellValue::Float);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map_or(CellValue::Null, CellValue::Text);
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return value.map_or(CellValue::Null, |bytes| CellValue::Bytes { bytes });
    }
    CellValue::Null
}

struct PoolInner {
    sessions: HashMap<FileId, Arc<CsvSession>>,
    // LRU order, oldest first
    order: VecDeque<FileId>,
    total_footprint: u64,
}

impl PoolInner {
    fn touch(&mut self, file_id: FileId) {
        if let Some(position) = self.order.iter().position(|id| *id == file_id) {
            self.order.remove(position);
            self.order.push_back(file_id);
        }
    }

    fn remove(&mut self, file_id: FileId) -> Option<Arc<CsvSession>> {
        let session = self.sessions.remove(&file_id)?;
        if let Some(position) = self.order.iter().position(|id| *id == file_id) {
            self.order.remove(position);
        }
        self.total_footprint = self.total_footprint.saturating_sub(session.footprint);
        Some(session)
    }
}

/// Keyed pool of CSV sessions with cap enforcement and LRU eviction
pub struct CsvSessionPool {
    blob: Arc<dyn BlobStore>,
    source_cap: ByteCap,
    session_cap: ByteCap,
    pool_cap: ByteCap,
    inner: Mutex<PoolInner>,
}

impl CsvSessionPool {
    /// Creates an empty pool over the given blob store and caps
    #[must_use]
    pub fn new(
        blob: Arc<dyn BlobStore>,
        source_cap: ByteCap,
        session_cap: ByteCap,
        pool_cap: ByteCap,
    ) -> Self {
        Self {
            blob,
            source_cap,
            session_cap,
            pool_cap,
            inner: Mutex::new(PoolInner {
                sessions: HashMap::new(),
                order: VecDeque::new(),
                total_footprint: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Aggregate footprint of all live sessions, in bytes
    #[must_use]
    pub fn total_footprint(&self) -> u64 {
        self.lock().total_footprint
    }

    /// Whether a session is currently materialized for the file
    #[must_use]
    pub fn contains(&self, file_id: FileId) -> bool {
        self.lock().sessions.contains_key(&file_id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Returns the session for a file, materializing it on first use.
    ///
    /// # Errors
    ///
    /// `too_large` when a cap rejects the file; `not_found` when the blob is
    /// gone; storage errors from the in-memory engine.
    pub async fn admit(&self, file_id: FileId, owner: &UserId) -> GatewayResult<Arc<CsvSession>> {
        if let Some(existing) = {
            let mut inner = self.lock();
            let found = inner.sessions.get(&file_id).cloned();
            if found.is_some() {
                inner.touch(file_id);
            }
            found
        } {
            return Ok(existing);
        }

        let signed_url = self.blob.signed_url(file_id).await?;
        let bytes: Bytes = self.blob.fetch(&signed_url).await?;
        if bytes.len() as u64 > self.source_cap.as_u64() {
            return Err(GatewayError::TooLarge {
                what: "CSV source",
                cap: self.source_cap.as_u64(),
            });
        }

        let parsed = parse_csv(&bytes)?;
        if parsed.footprint() > self.session_cap.as_u64() {
            return Err(GatewayError::TooLarge {
                what: "materialized CSV session",
                cap: self.session_cap.as_u64(),
            });
        }

        let session = Arc::new(CsvSession::load(file_id, owner.clone(), parsed).await?);
        Ok(self.insert(session))
    }

    /// Inserts a freshly loaded session, evicting LRU entries until the
    /// aggregate cap fits. A concurrent admission of the same file wins the
    /// race; the duplicate build is discarded.
    fn insert(&self, session: Arc<CsvSession>) -> Arc<CsvSession> {
        let mut inner = self.lock();
        if let Some(existing) = inner.sessions.get(&session.file_id) {
            return existing.clone();
        }
        while inner.total_footprint + session.footprint > self.pool_cap.as_u64() {
            let Some(oldest) = inner.order.front().copied() else { break };
            if let Some(evicted) = inner.remove(oldest) {
                info!(file_id = %oldest, footprint = evicted.footprint, "evicting CSV session (LRU)");
            }
        }
        inner.total_footprint += session.footprint;
        inner.order.push_back(session.file_id);
        inner.sessions.insert(session.file_id, session.clone());
        debug!(
            file_id = %session.file_id,
            footprint = session.footprint,
            total = inner.total_footprint,
            "CSV session admitted"
        );
        session
    }

    /// Explicitly releases one session
    pub fn release(&self, file_id: FileId) {
        self.lock().remove(file_id);
    }

    /// Releases every session owned by a user; called on logout
    pub fn release_owner(&self, owner: &UserId) {
        let mut inner = self.lock();
        let doomed: Vec<FileId> = inner
            .sessions
            .iter()
            .filter(|(_, session)| session.owner == *owner)
            .map(|(id, _)| *id)
            .collect();
        for file_id in doomed {
            inner.remove(file_id);
        }
    }

    /// Drops every session; shutdown path
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.sessions.clear();
        inner.order.clear();
        inner.total_footprint = 0;
    }
}

#[async_trait]
impl CsvBackend for CsvSessionPool {
    async fn describe(&self, file_id: FileId, owner: &UserId) -> GatewayResult<CsvDescription> {
        let session = self.admit(file_id, owner).await?;
        Ok(CsvDescription {
            table_name: Some(session.table_name().to_string()),
            schema_text: session.schema_text(),
        })
    }

    async fn execute(
        &self,
        file_id: FileId,
        owner: &UserId,
        directive: &str,
    ) -> GatewayResult<TableResult> {
        let session = self.admit(file_id, owner).await?;
        session.run_sql(directive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn caps(source: u64, session: u64, pool: u64) -> (ByteCap, ByteCap, ByteCap) {
        (
            ByteCap::try_new(source).unwrap(),
            ByteCap::try_new(session).unwrap(),
            ByteCap::try_new(pool).unwrap(),
        )
    }

    fn owner() -> UserId {
        UserId::try_new("tester".to_string()).unwrap()
    }

    async fn store_with(files: &[(FileId, &str)]) -> Arc<MemoryBlobStore> {
        let store = Arc::new(MemoryBlobStore::new());
        for (file_id, content) in files {
            store
                .put(*file_id, Bytes::from(content.to_string()))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn cold_admission_materializes_and_answers_sql() {
        let file_id = FileId::generate();
        let blob = store_with(&[(file_id, "status,count\nopen,3\nclosed,5\nopen,2\n")]).await;
        let (source, session, pool_cap) = caps(1 << 20, 1 << 20, 1 << 20);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);

        let description = pool.describe(file_id, &owner()).await.unwrap();
        let table = description.table_name.unwrap();
        assert_eq!(table, bound_table_name(file_id));
        assert!(description.schema_text.contains("status TEXT"));

        let sql = format!("SELECT COUNT(*) AS count FROM {table} WHERE status = 'open'");
        let result = pool.execute(file_id, &owner(), &sql).await.unwrap();
        assert_eq!(result.columns, vec!["count"]);
        assert_eq!(result.row_count, 1);
        assert_eq!(result.rows[0][0], CellValue::Int(2));
    }

    #[tokio::test]
    async fn source_exactly_at_cap_is_accepted_one_byte_over_rejected() {
        let content = "a,b\n1,2\n";
        let at_cap = FileId::generate();
        let over_cap = FileId::generate();
        let blob = store_with(&[(at_cap, content), (over_cap, content)]).await;

        let (source, session, pool_cap) =
            caps(content.len() as u64, 1 << 20, 1 << 20);
        let pool = CsvSessionPool::new(blob.clone(), source, session, pool_cap);
        assert!(pool.admit(at_cap, &owner()).await.is_ok());

        let (source, session, pool_cap) =
            caps(content.len() as u64 - 1, 1 << 20, 1 << 20);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);
        let result = pool.admit(over_cap, &owner()).await;
        assert!(matches!(result, Err(GatewayError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn aggregate_pressure_evicts_oldest_first() {
        let f1 = FileId::generate();
        let f2 = FileId::generate();
        let f3 = FileId::generate();
        let content = "n,text\n1,aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n";
        let blob = store_with(&[(f1, content), (f2, content), (f3, content)]).await;

        let one = parse_csv(&Bytes::from(content)).unwrap().footprint();
        // Pool fits two sessions but not three.
        let (source, session, pool_cap) = caps(1 << 20, one, one * 2);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);

        pool.admit(f1, &owner()).await.unwrap();
        pool.admit(f2, &owner()).await.unwrap();
        assert_eq!(pool.session_count(), 2);

        pool.admit(f3, &owner()).await.unwrap();
        assert_eq!(pool.session_count(), 2);
        assert!(!pool.contains(f1), "oldest must go first");
        assert!(pool.contains(f2));
        assert!(pool.contains(f3));
        assert!(pool.total_footprint() <= pool_cap.as_u64());
    }

    #[tokio::test]
    async fn touching_a_session_protects_it_from_eviction() {
        let f1 = FileId::generate();
        let f2 = FileId::generate();
        let f3 = FileId::generate();
        let content = "n,text\n1,aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n";
        let blob = store_with(&[(f1, content), (f2, content), (f3, content)]).await;

        let one = parse_csv(&Bytes::from(content)).unwrap().footprint();
        let (source, session, pool_cap) = caps(1 << 20, one, one * 2);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);

        pool.admit(f1, &owner()).await.unwrap();
        pool.admit(f2, &owner()).await.unwrap();
        // Re-access f1 so f2 becomes the LRU victim.
        pool.admit(f1, &owner()).await.unwrap();
        pool.admit(f3, &owner()).await.unwrap();

        assert!(pool.contains(f1));
        assert!(!pool.contains(f2));
        assert!(pool.contains(f3));
    }

    #[tokio::test]
    async fn owner_logout_releases_only_their_sessions() {
        let mine = FileId::generate();
        let theirs = FileId::generate();
        let content = "a\n1\n";
        let blob = store_with(&[(mine, content), (theirs, content)]).await;
        let (source, session, pool_cap) = caps(1 << 20, 1 << 20, 1 << 20);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);

        let alice = UserId::try_new("alice".to_string()).unwrap();
        let bob = UserId::try_new("bob".to_string()).unwrap();
        pool.admit(mine, &alice).await.unwrap();
        pool.admit(theirs, &bob).await.unwrap();

        pool.release_owner(&alice);
        assert!(!pool.contains(mine));
        assert!(pool.contains(theirs));
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_file() {
        let f1 = FileId::generate();
        let f2 = FileId::generate();
        let blob = store_with(&[(f1, "a\n1\n"), (f2, "b\n2\n")]).await;
        let (source, session, pool_cap) = caps(1 << 20, 1 << 20, 1 << 20);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);

        pool.admit(f1, &owner()).await.unwrap();
        pool.admit(f2, &owner()).await.unwrap();

        // f1's database has no table bound to f2's name.
        let cross = format!("SELECT * FROM {}", bound_table_name(f2));
        let result = pool.execute(f1, &owner(), &cross).await;
        // Same directive against f2 succeeds; against f1 it cannot resolve
        // the table because each session owns a private database.
        assert!(pool.execute(f2, &owner(), &cross).await.is_ok());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn null_cells_survive_materialization() {
        let file_id = FileId::generate();
        let blob = store_with(&[(file_id, "n,label\n1,\n2,x\n")]).await;
        let (source, session, pool_cap) = caps(1 << 20, 1 << 20, 1 << 20);
        let pool = CsvSessionPool::new(blob, source, session, pool_cap);

        let table = bound_table_name(file_id);
        let result = pool
            .execute(
                file_id,
                &owner(),
                &format!("SELECT label FROM {table} ORDER BY n"),
            )
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], CellValue::Null);
        assert_eq!(result.rows[1][0], CellValue::Text("x".to_string()));
    }
}
