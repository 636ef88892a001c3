//! Analytic CSV backend
//!
//! Answers questions about an uploaded CSV by profiling it column-wise in
//! memory: counts, nulls, distinct values, min/max, mean. The raw profile is
//! summarized by the LLM downstream; nothing here is materialized into SQL.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{CsvBackend, CsvColumnType, CsvDescription, ParsedCsv, parse_csv};
use crate::blob::BlobStore;
use crate::domain::{ByteCap, CellValue, FileId, TableResult, UserId};
use crate::error::{GatewayError, GatewayResult};

/// Column-profiling engine over raw CSV bytes
pub struct AnalyticCsvEngine {
    blob: Arc<dyn BlobStore>,
    source_cap: ByteCap,
}

impl AnalyticCsvEngine {
    /// Engine over the given blob store, bounded by the source cap
    #[must_use]
    pub fn new(blob: Arc<dyn BlobStore>, source_cap: ByteCap) -> Self {
        Self { blob, source_cap }
    }

    async fn load(&self, file_id: FileId) -> GatewayResult<ParsedCsv> {
        let signed_url = self.blob.signed_url(file_id).await?;
        let bytes = self.blob.fetch(&signed_url).await?;
        if bytes.len() as u64 > self.source_cap.as_u64() {
            return Err(GatewayError::TooLarge {
                what: "CSV source",
                cap: self.source_cap.as_u64(),
            });
        }
        parse_csv(&bytes)
    }
}

#[async_trait]
impl CsvBackend for AnalyticCsvEngine {
    async fn describe(&self, file_id: FileId, _owner: &UserId) -> GatewayResult<CsvDescription> {
        let parsed = self.load(file_id).await?;
        use std::fmt::Write as _;
        let mut text = String::new();
        let _ = writeln!(text, "CSV file with {} rows:", parsed.rows.len());
        for (name, column_type) in parsed.headers.iter().zip(&parsed.column_types) {
            let _ = writeln!(text, "  - {name} {}", column_type.sql_name());
        }
        Ok(CsvDescription {
            table_name: None,
            schema_text: text,
        })
    }

    async fn execute(
        &self,
        file_id: FileId,
        _owner: &UserId,
        _directive: &str,
    ) -> GatewayResult<TableResult> {
        let parsed = self.load(file_id).await?;
        Ok(profile(&parsed))
    }
}

/// One summary row per column
fn profile(parsed: &ParsedCsv) -> TableResult {
    let columns = vec![
        "column".to_string(),
        "type".to_string(),
        "count".to_string(),
        "nulls".to_string(),
        "distinct".to_string(),
        "min".to_string(),
        "max".to_string(),
        "mean".to_string(),
    ];
    let mut rows = Vec::with_capacity(parsed.headers.len());
    for (index, (name, column_type)) in parsed
        .headers
        .iter()
        .zip(&parsed.column_types)
        .enumerate()
    {
        rows.push(profile_column(parsed, index, name, *column_type));
    }
    let row_count = rows.len();
    TableResult {
        columns,
        rows,
        row_count,
    }
}

fn profile_column(
    parsed: &ParsedCsv,
    index: usize,
    name: &str,
    column_type: CsvColumnType,
) -> Vec<CellValue> {
    let mut count = 0i64;
    let mut nulls = 0i64;
    let mut distinct: HashSet<&str> = HashSet::new();
    let mut numeric_sum = 0f64;
    let mut numeric_min = f64::INFINITY;
    let mut numeric_max = f64::NEG_INFINITY;
    let mut text_min: Option<&str> = None;
    let mut text_max: Option<&str> = None;

    for row in &parsed.rows {
        let Some(cell) = row.get(index) else { continue };
        if cell.is_empty() {
            nulls += 1;
            continue;
        }
        count += 1;
        distinct.insert(cell.as_str());
        match column_type {
            CsvColumnType::Integer | CsvColumnType::Real => {
                if let Ok(value) = cell.parse::<f64>() {
                    numeric_sum += value;
                    numeric_min = numeric_min.min(value);
                    numeric_max = numeric_max.max(value);
                }
            }
            CsvColumnType::Text => {
                text_min = Some(text_min.map_or(cell.as_str(), |m| m.min(cell.as_str())));
                text_max = Some(text_max.map_or(cell.as_str(), |m| m.max(cell.as_str())));
            }
        }
    }

    let numeric_mean = if count > 0 { numeric_sum / count as f64 } else { 0.0 };
    let (min, max, mean) = match column_type {
        CsvColumnType::Integer | CsvColumnType::Real if count > 0 => (
            CellValue::Float(numeric_min),
            CellValue::Float(numeric_max),
            CellValue::Float(numeric_mean),
        ),
        CsvColumnType::Text if count > 0 => (
            text_min.map_or(CellValue::Null, |m| CellValue::Text(m.to_string())),
            text_max.map_or(CellValue::Null, |m| CellValue::Text(m.to_string())),
            CellValue::Null,
        ),
        _ => (CellValue::Null, CellValue::Null, CellValue::Null),
    };

    vec![
        CellValue::Text(name.to_string()),
        CellValue::Text(column_type.sql_name().to_string()),
        CellValue::Int(count),
        CellValue::Int(nulls),
        CellValue::Int(i64::try_from(distinct.len()).unwrap_or(i64::MAX)),
        min,
        max,
        mean,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use bytes::Bytes;

    fn owner() -> UserId {
        UserId::try_new("tester".to_string()).unwrap()
    }

    async fn engine_with(content: &str) -> (AnalyticCsvEngine, FileId) {
        let blob = Arc::new(MemoryBlobStore::new());
        let file_id = FileId::generate();
        blob.put(file_id, Bytes::from(content.to_string()))
            .await
            .unwrap();
        (
            AnalyticCsvEngine::new(blob, ByteCap::try_new(1 << 20).unwrap()),
            file_id,
        )
    }

    #[tokio::test]
    async fn profile_covers_every_column() {
        let (engine, file_id) = engine_with("age,city\n30,paris\n40,lyon\n,paris\n").await;

        let result = engine
            .execute(file_id, &owner(), "describe the data")
            .await
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0][0], CellValue::Text("age".to_string()));
        // age: two values, one null, mean 35
        assert_eq!(result.rows[0][2], CellValue::Int(2));
        assert_eq!(result.rows[0][3], CellValue::Int(1));
        assert_eq!(result.rows[0][7], CellValue::Float(35.0));
        // city: two distinct values
        assert_eq!(result.rows[1][4], CellValue::Int(2));
        assert_eq!(result.rows[1][7], CellValue::Null);
    }

    #[tokio::test]
    async fn describe_has_no_bound_table_name() {
        let (engine, file_id) = engine_with("a\n1\n").await;
        let description = engine.describe(file_id, &owner()).await.unwrap();
        assert!(description.table_name.is_none());
        assert!(description.schema_text.contains("a INTEGER"));
    }
}
