//! SQLite persistence for Connection records and uploaded-file metadata
//!
//! The gateway persists nothing else: no customer table data, no query
//! history. Migrations are embedded and applied at startup.

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{AgentId, ConnectionId, DbKind, FileId, UserId};
use crate::error::{GatewayError, GatewayResult};

/// Embedded migrations, applied by [`Store::connect`]
static MIGRATOR: Migrator = sqlx::migrate!();

/// One persisted Connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Name.
    pub name: String,
    /// Db kind.
    pub db_kind: DbKind,
    /// Owner.
    pub owner: UserId,
    /// Agent id.
    pub agent_id: AgentId,
    /// Agent key digest.
    pub agent_key_digest: String,
    /// Created at.
    pub created_at: i64,
}

/// Metadata for one uploaded CSV
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// File id.
    pub file_id: FileId,
    /// Owner.
    pub owner: UserId,
    /// Filename.
    pub filename: String,
    /// Size bytes.
    pub size_bytes: i64,
    /// Created at.
    pub created_at: i64,
}

mod sql {
    pub(super) const INSERT_CONNECTION: &str = "INSERT INTO connections \
        (connection_id, name, db_kind, owner, agent_id, agent_key_digest, created_at) \
        VALUES (?, ?, ?, ?, ?, ?, ?)";

    pub(super) const SELECT_CONNECTION: &str = "SELECT connection_id, name, db_kind, owner, \
        agent_id, agent_key_digest, created_at FROM connections WHERE connection_id = ?";

    pub(super) const SELECT_CONNECTION_BY_AGENT: &str = "SELECT connection_id, name, db_kind, \
        owner, agent_id, agent_key_digest, created_at FROM connections WHERE agent_id = ?";

    pub(super) const LIST_CONNECTIONS_BY_OWNER: &str = "SELECT connection_id, name, db_kind, \
        owner, agent_id, agent_key_digest, created_at FROM connections WHERE owner = ? \
        ORDER BY created_at";

    pub(super) const LIST_AGENT_IDS_BY_OWNER: &str =
        "SELECT agent_id FROM connections WHERE owner = ?";

    pub(super) const DELETE_CONNECTION: &str = "DELETE FROM connections WHERE connection_id = ?";

    pub(super) const INSERT_FILE: &str = "INSERT INTO files \
        (file_id, owner, filename, size_bytes, created_at) VALUES (?, ?, ?, ?, ?)";

    pub(super) const SELECT_FILE: &str =
        "SELECT file_id, owner, filename, size_bytes, created_at FROM files WHERE file_id = ?";

    pub(super) const LIST_FILES_BY_OWNER: &str = "SELECT file_id, owner, filename, size_bytes, \
        created_at FROM files WHERE owner = ? ORDER BY created_at";

    pub(super) const DELETE_FILE: &str = "DELETE FROM files WHERE file_id = ?";
}

/// Current wall-clock as unix seconds
#[must_use]
pub fn now_unix() -> i64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Handle to the application database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the database, creating it if missing, and applies migrations.
    ///
    /// An in-memory URL pins the pool to a single connection so every query
    /// sees the same database.
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] if the database cannot be opened
    /// or a migration fails.
    pub async fn connect(database_url: &str) -> GatewayResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(GatewayError::Storage)?
            .create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| GatewayError::internal(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Cheap readiness probe used by the startup checks
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] if the database is unreachable.
    pub async fn ping(&self) -> GatewayResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Persists a new Connection
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on write failure.
    pub async fn create_connection(&self, record: &ConnectionRecord) -> GatewayResult<()> {
        sqlx::query(sql::INSERT_CONNECTION)
            .bind(record.connection_id.to_string())
            .bind(&record.name)
            .bind(record.db_kind.as_str())
            .bind(record.owner.to_string())
            .bind(record.agent_id.to_string())
            .bind(&record.agent_key_digest)
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads a Connection by its ID
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on read failure.
    pub async fn get_connection(
        &self,
        connection_id: ConnectionId,
    ) -> GatewayResult<Option<ConnectionRecord>> {
        let row = sqlx::query(sql::SELECT_CONNECTION)
            .bind(connection_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_connection(&r)).transpose()
    }

    /// Loads a Connection by its transport identity
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on read failure.
    pub async fn get_connection_by_agent(
        &self,
        agent_id: AgentId,
    ) -> GatewayResult<Option<ConnectionRecord>> {
        let row = sqlx::query(sql::SELECT_CONNECTION_BY_AGENT)
            .bind(agent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_connection(&r)).transpose()
    }

    /// Lists the Connections one user owns
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on read failure.
    pub async fn list_connections(&self, owner: &UserId) -> GatewayResult<Vec<ConnectionRecord>> {
        let rows = sqlx::query(sql::LIST_CONNECTIONS_BY_OWNER)
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_connection).collect()
    }

    /// Resolves the agent IDs a user owns, used to scope status subscribers
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on read failure.
    pub async fn owned_agent_ids(&self, owner: &UserId) -> GatewayResult<Vec<AgentId>> {
        let rows = sqlx::query(sql::LIST_AGENT_IDS_BY_OWNER)
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| parse_uuid_column(row, "agent_id").map(AgentId::new))
            .collect()
    }

    /// Deletes a Connection; returns whether a row was removed
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on write failure.
    pub async fn delete_connection(&self, connection_id: ConnectionId) -> GatewayResult<bool> {
        let result = sqlx::query(sql::DELETE_CONNECTION)
            .bind(connection_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persists uploaded-file metadata
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on write failure.
    pub async fn create_file(&self, record: &FileRecord) -> GatewayResult<()> {
        sqlx::query(sql::INSERT_FILE)
            .bind(record.file_id.to_string())
            .bind(record.owner.to_string())
            .bind(&record.filename)
            .bind(record.size_bytes)
            .bind(record.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads file metadata
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on read failure.
    pub async fn get_file(&self, file_id: FileId) -> GatewayResult<Option<FileRecord>> {
        let row = sqlx::query(sql::SELECT_FILE)
            .bind(file_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_file(&r)).transpose()
    }

    /// Lists the files one user owns
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on read failure.
    pub async fn list_files(&self, owner: &UserId) -> GatewayResult<Vec<FileRecord>> {
        let rows = sqlx::query(sql::LIST_FILES_BY_OWNER)
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_file).collect()
    }

    /// Deletes file metadata; returns whether a row was removed
    ///
    /// # Errors
    ///
    /// Returns a [`GatewayError::Storage`] on write failure.
    pub async fn delete_file(&self, file_id: FileId) -> GatewayResult<bool> {
        let result = sqlx::query(sql::DELETE_FILE)
            .bind(file_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_uuid_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> GatewayResult<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw)
        .map_err(|e| GatewayError::internal(format!("corrupt {column} in store: {e}")))
}

fn map_connection(row: &sqlx::sqlite::SqliteRow) -> GatewayResult<ConnectionRecord> {
    let owner_raw: String = row.try_get("owner")?;
    let db_kind_raw: String = row.try_get("db_kind")?;
    Ok(ConnectionRecord {
        connection_id: ConnectionId::new(parse_uuid_column(row, "connection_id")?),
        name: row.try_get("name")?,
        db_kind: DbKind::parse(&db_kind_raw),
        owner: UserId::try_new(owner_raw)
            .map_err(|e| GatewayError::internal(format!("corrupt owner in store: {e}")))?,
        agent_id: AgentId::new(parse_uuid_column(row, "agent_id")?),
        agent_key_digest: row.try_get("agent_key_digest")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_file(row: &sqlx::sqlite::SqliteRow) -> GatewayResult<FileRecord> {
    let owner_raw: String = row.try_get("owner")?;
    Ok(FileRecord {
        file_id: FileId::new(parse_uuid_column(row, "file_id")?),
        owner: UserId::try_new(owner_raw)
            .map_err(|e| GatewayError::internal(format!("corrupt owner in store: {e}")))?,
        filename: row.try_get("filename")?,
        size_bytes: row.try_get("size_bytes")?,
        created_at: row.try_get("created_at")?,
    })
}
