//! CSV query backends
//!
//! Two interchangeable engines answer questions about uploaded CSVs behind
//! [`CsvBackend`]: the session pool materializes the file as a private
//! in-memory SQL table, the analytic engine profiles it directly. Shared
//! parsing and type inference live here.

pub mod analytic;
pub mod pool;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{FileId, TableResult, UserId};
use crate::error::{GatewayError, GatewayResult};

/// What the orchestrator tells the LLM about a prepared CSV
#[derive(Debug, Clone)]
pub struct CsvDescription {
    /// Bound table name, present only for the SQL backend
    pub table_name: Option<String>,
    /// Schema or profile text for the prompt
    pub schema_text: String,
}

/// One interchangeable CSV engine
#[async_trait]
pub trait CsvBackend: Send + Sync {
    /// Prepares the file and describes it for prompt building
    async fn describe(&self, file_id: FileId, owner: &UserId) -> GatewayResult<CsvDescription>;

    /// Executes a directive against the file: SQL text for the SQL backend,
    /// the raw question for the analytic backend
    async fn execute(
        &self,
        file_id: FileId,
        owner: &UserId,
        directive: &str,
    ) -> GatewayResult<TableResult>;
}

/// Inferred storage class of one CSV column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvColumnType {
    /// Integer.
    Integer,
    /// Real.
    Real,
    /// Text.
    Text,
}

impl CsvColumnType {
    /// SQL type name used in generated DDL and prompt text
    #[must_use]
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

/// Parsed CSV: header row, raw cells, inferred column types
#[derive(Debug, Clone)]
pub struct ParsedCsv {
    /// Headers.
    pub headers: Vec<String>,
    /// Rows.
    pub rows: Vec<Vec<String>>,
    /// Column types.
    pub column_types: Vec<CsvColumnType>,
}

impl ParsedCsv {
    /// Approximate in-memory footprint of the materialized table, in bytes.
    ///
    /// Approximate by contract; enforced exactly against the caps.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        const ROW_OVERHEAD: u64 = 24;
        let mut total = 0u64;
        for row in &self.rows {
            total += ROW_OVERHEAD;
            for (cell, column_type) in row.iter().zip(&self.column_types) {
                total += match column_type {
                    CsvColumnType::Integer | CsvColumnType::Real => 8,
                    CsvColumnType::Text => cell.len() as u64 + 1,
                };
            }
        }
        total
    }
}

/// Parses CSV bytes with a header row and infers per-column types.
///
/// A column is INTEGER when every non-empty cell parses as i64, REAL when
/// every non-empty cell parses as f64, TEXT otherwise. Empty cells load as
/// NULL.
///
/// # Errors
///
/// Fails with `internal` on malformed CSV or an empty header row.
pub fn parse_csv(bytes: &Bytes) -> GatewayResult<ParsedCsv> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes.as_ref());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| GatewayError::internal(format!("unreadable CSV header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.is_empty() {
        return Err(GatewayError::internal("CSV has no header row"));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| GatewayError::internal(format!("unreadable CSV record: {e}")))?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<String>>());
    }

    let column_types = infer_column_types(&headers, &rows);
    Ok(ParsedCsv {
        headers,
        rows,
        column_types,
    })
}

fn infer_column_types(headers: &[String], rows: &[Vec<String>]) -> Vec<CsvColumnType> {
    (0..headers.len())
        .map(|index| {
            let mut seen_value = false;
            let mut all_int = true;
            let mut all_real = true;
            for row in rows {
                let Some(cell) = row.get(index) else { continue };
                if cell.is_empty() {
                    continue;
                }
                seen_value = true;
                if cell.parse::<i64>().is_err() {
                    all_int = false;
                }
                if cell.parse::<f64>().is_err() {
                    all_real = false;
                }
            }
            if seen_value {
                if all_int {
                    CsvColumnType::Integer
                } else if all_real {
                    CsvColumnType::Real
                } else {
                    CsvColumnType::Text
                }
            } else {
                CsvColumnType::Text
            }
        })
        .collect()
}

/// Deterministic, SQL-identifier-safe table name for a file.
///
/// Stable across processes so the LLM can be told the exact name to use.
#[must_use]
pub fn bound_table_name(file_id: FileId) -> String {
    let sanitized: String = file_id
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("csv_{sanitized}")
}

/// Quotes an identifier for the in-memory SQL engine
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_deterministic_and_identifier_safe() {
        let file_id = FileId::generate();
        let first = bound_table_name(file_id);
        let second = bound_table_name(file_id);
        assert_eq!(first, second);
        assert!(first.starts_with("csv_"));
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));

        assert_ne!(first, bound_table_name(FileId::generate()));
    }

    #[test]
    fn type_inference_distinguishes_int_real_text() {
        let bytes = Bytes::from_static(b"id,price,label\n1,1.5,a\n2,2,b\n3,,c\n");
        let parsed = parse_csv(&bytes).unwrap();
        assert_eq!(parsed.headers, vec!["id", "price", "label"]);
        assert_eq!(
            parsed.column_types,
            vec![
                CsvColumnType::Integer,
                CsvColumnType::Real,
                CsvColumnType::Text,
            ]
        );
        assert_eq!(parsed.rows.len(), 3);
    }

    #[test]
    fn footprint_grows_with_data() {
        let small = parse_csv(&Bytes::from_static(b"a\n1\n")).unwrap();
        let large = parse_csv(&Bytes::from_static(b"a\nhello world this is long\n")).unwrap();
        assert!(large.footprint() > small.footprint());
    }

    #[test]
    fn malformed_csv_is_an_error_not_a_panic() {
        let bytes = Bytes::from_static(b"a,b\n1,2,3\n");
        assert!(parse_csv(&bytes).is_err());
    }
}
