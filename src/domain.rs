//! Domain types for the Custard gateway
//!
//! Strongly-typed identifiers and value types used across the control plane,
//! to prevent primitive obsession and keep `connection_id` / `agent_id`
//! routing mistakes unrepresentable.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use nutype::nutype;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier for a user-declared Connection record
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Transport identity of a connector agent, distinct from [`ConnectionId`]
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct AgentId(Uuid);

impl AgentId {
    /// Creates a new random agent ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for an uploaded CSV file
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct FileId(Uuid);

impl FileId {
    /// Creates a new random file ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Subject identifier issued by the external identity provider
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct UserId(String);

/// Monotonically increasing per-agent session generation.
///
/// A reconnect bumps the epoch; sinks registered under an older epoch can
/// never observe replies from the new session.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct SessionEpoch(u64);

/// Process-wide request identifier allocated by the correlator
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RequestId(u64);

/// Opaque high-entropy credential bound to one Connection.
///
/// Shown to the user exactly once at creation; only its digest is persisted.
/// There is no in-place rotation; a new Connection is the rotation path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKey(String);

impl AgentKey {
    const ENTROPY_BYTES: usize = 32;

    /// Draws a fresh key from the OS CSPRNG
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = [0u8; Self::ENTROPY_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Wraps a key presented by an agent during handshake
    #[must_use]
    pub fn from_presented(token: String) -> Self {
        Self(token)
    }

    /// SHA-256 hex digest, the only form ever written to storage
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex_encode(&hasher.finalize())
    }

    /// The one-time display form returned at Connection creation
    #[must_use]
    pub fn reveal(&self) -> &str {
        &self.0
    }

    /// Comparison against a stored digest
    #[must_use]
    pub fn matches_digest(&self, stored_digest: &str) -> bool {
        self.digest() == stored_digest
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Informational database-kind tag on a Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    /// Postgres.
    Postgres,
    /// Mysql.
    Mysql,
    /// Sqlite.
    Sqlite,
    /// Mssql.
    Mssql,
    /// Other.
    Other,
}

impl DbKind {
    /// Stable storage tag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlite => "sqlite",
            Self::Mssql => "mssql",
            Self::Other => "other",
        }
    }

    /// Parses the stable storage tag
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag {
            "postgres" => Self::Postgres,
            "mysql" => Self::Mysql,
            "sqlite" => Self::Sqlite,
            "mssql" => Self::Mssql,
            _ => Self::Other,
        }
    }
}

/// One cell of a tabular query result.
///
/// The wire carries values in self-describing JSON and the gateway never
/// interprets them; bytes travel base64-coded under a `bytes` wrapper so the
/// closed set survives the JSON round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// Null.
    Null,
    /// Bool.
    Bool(bool),
    /// Int.
    Int(i64),
    /// Float.
    Float(f64),
    /// Text.
    Text(String),
    /// Bytes.
    Bytes {
        #[serde(with = "base64_bytes")]
        /// Bytes.
        bytes: Vec<u8>,
    },
}

impl CellValue {
    /// Rendering used when a result table is flattened into LLM prompt text
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Bytes { bytes } => format!("<{} bytes>", bytes.len()),
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Tabular result of one executed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableResult {
    /// Columns.
    pub columns: Vec<String>,
    /// Rows.
    pub rows: Vec<Vec<CellValue>>,
    /// Row count.
    pub row_count: usize,
}

impl TableResult {
    /// An empty result with no columns
    #[must_use]
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
        }
    }

    /// Compact textual rendering passed to the LLM for summarization.
    ///
    /// Long results are truncated row-wise; the LLM sees the shape and a
    /// sample, never an unbounded dump.
    #[must_use]
    pub fn render_for_prompt(&self, max_rows: usize) -> String {
        let mut out = self.columns.join(" | ");
        out.push('\n');
        for row in self.rows.iter().take(max_rows) {
            let line: Vec<String> = row.iter().map(CellValue::render).collect();
            out.push_str(&line.join(" | "));
            out.push('\n');
        }
        if self.rows.len() > max_rows {
            use std::fmt::Write as _;
            let _ = writeln!(out, "... ({} rows total)", self.row_count);
        }
        out
    }
}

/// Capacity of a bounded per-session or per-subscriber frame queue
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 256
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Byte cap used by the CSV session pool
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct ByteCap(u64);

impl ByteCap {
    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_agent_ids_are_unique_per_generate() {
        assert_ne!(ConnectionId::generate(), ConnectionId::generate());
        assert_ne!(AgentId::generate(), AgentId::generate());
    }

    #[test]
    fn agent_key_digest_is_stable_and_hides_the_token() {
        let key = AgentKey::generate();
        let digest = key.digest();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, key.digest());
        assert!(!digest.contains(key.reveal()));

        let presented = AgentKey::from_presented(key.reveal().to_string());
        assert!(presented.matches_digest(&digest));

        let wrong = AgentKey::generate();
        assert!(!wrong.matches_digest(&digest));
    }

    #[test]
    fn fresh_keys_never_collide() {
        let a = AgentKey::generate();
        let b = AgentKey::generate();
        assert_ne!(a.reveal(), b.reveal());
    }

    #[test]
    fn cell_values_round_trip_as_self_describing_json() {
        let cells = vec![
            CellValue::Null,
            CellValue::Bool(true),
            CellValue::Int(42),
            CellValue::Float(1.5),
            CellValue::Text("hello".to_string()),
            CellValue::Bytes {
                bytes: vec![0, 1, 2, 255],
            },
        ];
        let json = serde_json::to_string(&cells).unwrap();
        let back: Vec<CellValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(cells, back);
    }

    #[test]
    fn integer_cells_stay_integers_through_json() {
        let json = "[1, 2.5, null, false, \"x\"]";
        let cells: Vec<CellValue> = serde_json::from_str(json).unwrap();
        assert_eq!(
            cells,
            vec![
                CellValue::Int(1),
                CellValue::Float(2.5),
                CellValue::Null,
                CellValue::Bool(false),
                CellValue::Text("x".to_string()),
            ]
        );
    }

    #[test]
    fn prompt_rendering_truncates_long_results() {
        let result = TableResult {
            columns: vec!["n".to_string()],
            rows: (0..10).map(|i| vec![CellValue::Int(i)]).collect(),
            row_count: 10,
        };
        let rendered = result.render_for_prompt(3);
        assert!(rendered.contains("(10 rows total)"));
        assert!(!rendered.contains("\n9\n"));
    }
}
