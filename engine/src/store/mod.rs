//! Tabular store guard
//!
//! `TabularStore` is the only path from generated queries to the data. It
//! applies the read-only `QueryPolicy`, executes through a `TabularBackend`,
//! caps result size at `max_query_results` and keeps a `SchemaDescriptor`
//! snapshot for prompt building. Schema rebuilds take the write side of a
//! `tokio::sync::RwLock`; queries and schema reads take the read side.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub mod ingest;
pub mod policy;
pub mod sqlite;

pub use policy::QueryPolicy;
pub use sqlite::SqliteBackend;

/// One result row; values are JSON scalars in column order.
pub type Row = Vec<Value>;

/// Columns and rows returned by a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Descriptive statistics for one numeric column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub column: String,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; absent for a single value
    pub std: Option<f64>,
    pub min: f64,
    pub max: f64,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(rows, columns)`
    pub fn shape(&self) -> (usize, usize) {
        (self.row_count(), self.column_count())
    }

    /// First `n` rows
    pub fn head(&self, n: usize) -> &[Row] {
        &self.rows[..n.min(self.rows.len())]
    }

    /// Drop every row past `limit`
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Rows as column-keyed JSON objects
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }

    /// Fixed-width text table of the first `limit` rows
    pub fn render_table(&self, limit: usize) -> String {
        let cells: Vec<Vec<String>> = self
            .head(limit)
            .iter()
            .map(|row| row.iter().map(render_cell).collect())
            .collect();

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                cells
                    .iter()
                    .filter_map(|r| r.get(i))
                    .map(|c| c.chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut lines = vec![format_line(self.columns.iter(), &widths)];
        lines.extend(cells.iter().map(|row| format_line(row.iter(), &widths)));
        lines.join("\n")
    }

    /// count / mean / std / min / max for every column whose non-null values
    /// are all numbers
    pub fn numeric_summary(&self) -> Vec<ColumnSummary> {
        let mut summaries = Vec::new();

        'columns: for (idx, column) in self.columns.iter().enumerate() {
            let mut values = Vec::new();
            for row in &self.rows {
                match row.get(idx) {
                    Some(Value::Number(n)) => match n.as_f64() {
                        Some(v) => values.push(v),
                        None => continue 'columns,
                    },
                    Some(Value::Null) | None => {}
                    Some(_) => continue 'columns,
                }
            }
            if values.is_empty() {
                continue;
            }

            let count = values.len();
            let mean = values.iter().sum::<f64>() / count as f64;
            let std = (count > 1).then(|| {
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
                variance.sqrt()
            });
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summaries.push(ColumnSummary {
                column: column.clone(),
                count,
                mean,
                std,
                min,
                max,
            });
        }

        summaries
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_line<'a>(cells: impl Iterator<Item = &'a String>, widths: &[usize]) -> String {
    cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

/// Column name / declared type / nullability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Schema snapshot of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: u64,
    pub sample: ResultSet,
}

/// Read-only snapshot of every table in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableSchema>,
}

impl SchemaDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Markdown rendering used as model context
    pub fn describe(&self) -> String {
        let mut parts = vec!["# Database Schema\n".to_string()];

        for table in &self.tables {
            parts.push(format!("\n## Table: {}", table.name));
            parts.push(format!("Row count: {}", table.row_count));
            parts.push("\nColumns:".to_string());

            for col in &table.columns {
                let nullable = if col.nullable { "NULL" } else { "NOT NULL" };
                parts.push(format!("  - {} ({}) {}", col.name, col.data_type, nullable));
            }

            if let Some(first) = table.sample.to_records().into_iter().next() {
                parts.push("\nSample data:".to_string());
                parts.push(format!("  {}", Value::Object(first)));
            }
        }

        parts.join("\n")
    }
}

/// Per-table statistics derived from the schema snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub table_name: String,
    pub row_count: u64,
    pub column_count: usize,
    pub columns: Vec<ColumnInfo>,
}

/// Query execution surface behind the guard
#[async_trait]
pub trait TabularBackend: Send + Sync {
    /// Run a query and return every row
    async fn run_query(&self, sql: &str) -> anyhow::Result<ResultSet>;

    /// Names of all user tables
    async fn table_names(&self) -> anyhow::Result<Vec<String>>;

    /// Columns, row count and the first `sample_rows` rows of a table
    async fn table_schema(&self, table: &str, sample_rows: usize) -> anyhow::Result<TableSchema>;
}

/// Guarded, read-only access to the tabular data
pub struct TabularStore {
    backend: Arc<dyn TabularBackend>,
    policy: QueryPolicy,
    schema: RwLock<SchemaDescriptor>,
    max_query_results: usize,
    sample_rows: usize,
}

impl TabularStore {
    /// Wrap a backend; the schema snapshot starts empty until `rebuild_schema`
    pub fn new(
        backend: Arc<dyn TabularBackend>,
        max_query_results: usize,
        sample_rows: usize,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            backend,
            policy: QueryPolicy::new()?,
            schema: RwLock::new(SchemaDescriptor::default()),
            max_query_results,
            sample_rows,
        })
    }

    pub fn max_query_results(&self) -> usize {
        self.max_query_results
    }

    /// Current schema snapshot
    pub async fn describe_schema(&self) -> SchemaDescriptor {
        self.schema.read().await.clone()
    }

    /// Markdown schema text for prompts
    pub async fn schema_description(&self) -> String {
        self.schema.read().await.describe()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.schema.read().await.table_names()
    }

    /// Statistics for one table, `None` when unknown
    pub async fn table_stats(&self, table: &str) -> Option<TableStats> {
        let schema = self.schema.read().await;
        schema.table(table).map(|t| TableStats {
            table_name: t.name.clone(),
            row_count: t.row_count,
            column_count: t.columns.len(),
            columns: t.columns.clone(),
        })
    }

    /// Rebuild the schema snapshot from the backend
    ///
    /// Holds the write lock for the whole rebuild so no query observes a
    /// half-built snapshot. A table that cannot be described is skipped.
    pub async fn rebuild_schema(&self) -> Result<usize, EngineError> {
        let mut schema = self.schema.write().await;

        let names = self
            .backend
            .table_names()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to list tables: {}", e)))?;

        let mut tables = Vec::with_capacity(names.len());
        for name in &names {
            match self.backend.table_schema(name, self.sample_rows).await {
                Ok(table) => tables.push(table),
                Err(e) => error!("Error building schema info for {}: {}", name, e),
            }
        }

        let count = tables.len();
        *schema = SchemaDescriptor { tables };
        info!("Schema information built for {} tables", count);
        Ok(count)
    }

    /// Tables-loaded notification from the loader; triggers a full rebuild
    pub async fn on_tables_loaded(
        &self,
        loaded: &BTreeMap<String, u64>,
    ) -> Result<usize, EngineError> {
        for (table, rows) in loaded {
            info!("Loaded {}: {} rows", table, rows);
        }
        self.rebuild_schema().await
    }

    /// Validate and run a query
    ///
    /// # Errors
    ///
    /// - `EngineError::QueryRejected` when the policy blocks the query; the
    ///   backend is not called
    /// - `EngineError::QueryFailed` when the backend reports an error
    pub async fn execute(&self, query: &str) -> Result<ResultSet, EngineError> {
        if let Err(e) = self.policy.check(query) {
            warn!(
                "Potentially dangerous query blocked: {}",
                query.chars().take(100).collect::<String>()
            );
            return Err(e);
        }

        let _schema = self.schema.read().await;
        debug!("Executing query: {}", query);

        let mut result = match self.backend.run_query(query).await {
            Ok(result) => result,
            Err(e) => {
                let err = EngineError::QueryFailed(e.to_string());
                error!("{}", err);
                return Err(err);
            }
        };

        if result.row_count() > self.max_query_results {
            warn!(
                "Query returned {} rows, limiting to {}",
                result.row_count(),
                self.max_query_results
            );
            result.truncate(self.max_query_results);
        }

        info!(
            "Query executed successfully: {} rows returned",
            result.row_count()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that counts calls and returns a fixed number of rows.
    struct SpyBackend {
        rows: usize,
        calls: AtomicUsize,
        fail_with: Option<String>,
    }

    impl SpyBackend {
        fn with_rows(rows: usize) -> Self {
            Self {
                rows,
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl TabularBackend for SpyBackend {
        async fn run_query(&self, _sql: &str) -> anyhow::Result<ResultSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = &self.fail_with {
                anyhow::bail!("{}", msg);
            }
            let rows = (0..self.rows).map(|i| vec![json!(i)]).collect();
            Ok(ResultSet::new(vec!["n".to_string()], rows))
        }

        async fn table_names(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec!["orders".to_string(), "broken".to_string()])
        }

        async fn table_schema(&self, table: &str, _: usize) -> anyhow::Result<TableSchema> {
            if table == "broken" {
                anyhow::bail!("no such table");
            }
            Ok(TableSchema {
                name: table.to_string(),
                columns: vec![ColumnInfo {
                    name: "price".to_string(),
                    data_type: "REAL".to_string(),
                    nullable: false,
                }],
                row_count: self.rows as u64,
                sample: ResultSet::new(vec!["price".to_string()], vec![vec![json!(9.5)]]),
            })
        }
    }

    #[tokio::test]
    async fn test_rejected_query_never_reaches_backend() {
        let backend = Arc::new(SpyBackend::with_rows(3));
        let store = TabularStore::new(backend.clone(), 1000, 3).unwrap();

        let err = store.execute("DROP TABLE orders").await.unwrap_err();

        assert!(err.to_string().contains("dangerous"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_results_truncated_to_ceiling() {
        let backend = Arc::new(SpyBackend::with_rows(25));
        let store = TabularStore::new(backend, 10, 3).unwrap();

        let result = store.execute("SELECT n FROM t").await.unwrap();
        assert_eq!(result.row_count(), 10);
        assert_eq!(result.rows[9], vec![json!(9)]);
    }

    #[tokio::test]
    async fn test_backend_failure_is_query_failed() {
        let backend = Arc::new(SpyBackend {
            rows: 0,
            calls: AtomicUsize::new(0),
            fail_with: Some("no such column: revenue".to_string()),
        });
        let store = TabularStore::new(backend, 10, 3).unwrap();

        let err = store.execute("SELECT revenue FROM orders").await.unwrap_err();
        assert!(matches!(err, EngineError::QueryFailed(_)));
        assert_eq!(
            err.to_string(),
            "Query execution error: no such column: revenue"
        );
    }

    #[tokio::test]
    async fn test_rebuild_skips_broken_tables() {
        let store = TabularStore::new(Arc::new(SpyBackend::with_rows(4)), 10, 3).unwrap();
        assert!(store.describe_schema().await.is_empty());

        let mut loaded = BTreeMap::new();
        loaded.insert("orders".to_string(), 4);
        let count = store.on_tables_loaded(&loaded).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(store.table_names().await, vec!["orders".to_string()]);
        let stats = store.table_stats("orders").await.unwrap();
        assert_eq!(stats.row_count, 4);
        assert_eq!(stats.column_count, 1);
        assert!(store.table_stats("broken").await.is_none());

        let text = store.schema_description().await;
        assert!(text.contains("## Table: orders"));
        assert!(text.contains("  - price (REAL) NOT NULL"));
        assert!(text.contains("Sample data:"));
    }

    #[test]
    fn test_numeric_summary_skips_text_columns() {
        let result = ResultSet::new(
            vec!["category".to_string(), "revenue".to_string()],
            vec![
                vec![json!("toys"), json!(10.0)],
                vec![json!("books"), json!(20.0)],
                vec![json!("garden"), json!(null)],
                vec![json!("games"), json!(30)],
            ],
        );

        let summary = result.numeric_summary();
        assert_eq!(summary.len(), 1);
        let revenue = &summary[0];
        assert_eq!(revenue.column, "revenue");
        assert_eq!(revenue.count, 3);
        assert!((revenue.mean - 20.0).abs() < 1e-9);
        assert!((revenue.std.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(revenue.min, 10.0);
        assert_eq!(revenue.max, 30.0);
    }

    #[test]
    fn test_render_table_aligns_columns() {
        let result = ResultSet::new(
            vec!["name".to_string(), "n".to_string()],
            vec![vec![json!("abc"), json!(1)], vec![json!(null), json!(22)]],
        );
        assert_eq!(result.render_table(10), "name  n\nabc   1\nNULL  22");
        assert_eq!(result.render_table(1), "name  n\nabc   1");
    }

    #[test]
    fn test_head_and_shape() {
        let rows = (0..15).map(|i| vec![json!(i), json!("x")]).collect();
        let result = ResultSet::new(vec!["a".into(), "b".into()], rows);
        assert_eq!(result.shape(), (15, 2));
        assert_eq!(result.head(10).len(), 10);
        assert_eq!(result.head(100).len(), 15);
        assert_eq!(result.to_records()[0]["a"], json!(0));
    }
}
