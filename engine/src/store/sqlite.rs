//! SQLite backend for the tabular store
//!
//! Two pools share one database. The reader pool runs every guarded query
//! with `PRAGMA query_only = ON`, so SQLite itself refuses writes that slip
//! past the keyword policy. The admin pool is used only by the loaders
//! (`load_script`, `load_csv_file`, `load_csv_dir`), which run trusted input
//! and report the resulting row counts so the caller can notify the guard.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Executor, Row, TypeInfo, ValueRef};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use super::ingest::{self, ColumnKind, CsvTable};
use super::{ColumnInfo, ResultSet, TabularBackend, TableSchema};

/// Pooled SQLite connections holding the loaded tables
pub struct SqliteBackend {
    /// Read-write; loaders and maintenance only
    pool: SqlitePool,
    /// `query_only`; everything the guard lets through
    reader: SqlitePool,
}

fn read_only(options: &SqliteConnectOptions) -> SqliteConnectOptions {
    options.clone().pragma("query_only", "ON")
}

impl SqliteBackend {
    /// Open (or create) the database file in WAL mode
    pub async fn connect(db_path: &Path) -> Result<Self> {
        info!("Opening tabular store at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.clone())
            .await
            .context("Failed to connect to database")?;
        let reader = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(read_only(&options))
            .await
            .context("Failed to open read-only connection")?;

        debug!("Database connection established");
        Ok(Self { pool, reader })
    }

    /// Private in-memory database
    ///
    /// Both pools hold one long-lived connection to the same shared-cache
    /// database, which lives as long as those connections do.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .disable_statement_logging();

        let single = || {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        };
        let pool = single()
            .connect_with(options.clone())
            .await
            .context("Failed to open in-memory database")?;
        let reader = single()
            .connect_with(read_only(&options))
            .await
            .context("Failed to open read-only connection")?;

        Ok(Self { pool, reader })
    }

    /// Read-write pool used by the loaders
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run a trusted seed script and return the row count of every table
    pub async fn load_script(&self, script: &str) -> Result<BTreeMap<String, u64>> {
        info!("Running seed script ({} bytes)", script.len());

        sqlx::raw_sql(script)
            .execute(&self.pool)
            .await
            .context("Failed to execute seed script")?;

        self.row_counts().await
    }

    /// Read a seed script from disk and run it
    pub async fn load_script_file(&self, path: &Path) -> Result<BTreeMap<String, u64>> {
        let script = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read seed script {}", path.display()))?;
        self.load_script(&script).await
    }

    /// Load one CSV file into the table named after it, replacing that table
    ///
    /// Returns the table name and its row count.
    pub async fn load_csv_file(&self, path: &Path) -> Result<(String, u64)> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table = ingest::parse_csv(ingest::table_name_for(path), bytes.as_slice())
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let rows = self.write_table(&table).await?;
        info!("Loaded {}: {} rows", table.name, rows);
        Ok((table.name, rows))
    }

    /// Load every `*.csv` file in a directory, one table per file
    ///
    /// A file that fails to load is logged and skipped.
    pub async fn load_csv_dir(&self, dir: &Path) -> Result<BTreeMap<String, u64>> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if ingest::is_csv(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            warn!("No CSV files found in {}", dir.display());
        }

        let mut loaded = BTreeMap::new();
        for path in &paths {
            match self.load_csv_file(path).await {
                Ok((table, rows)) => {
                    loaded.insert(table, rows);
                }
                Err(e) => error!("Error loading {}: {:#}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    async fn write_table(&self, table: &CsvTable) -> Result<u64> {
        if table.columns.is_empty() {
            bail!("{} has no header row", table.name);
        }

        let name = quote_ident(&table.name);
        let column_defs = table
            .columns
            .iter()
            .zip(&table.kinds)
            .map(|(column, kind)| format!("{} {}", quote_ident(column), kind.sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; table.columns.len()].join(", ");
        let insert = format!("INSERT INTO {} VALUES ({})", name, placeholders);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", name))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE TABLE {} ({})", name, column_defs))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create table {}", table.name))?;

        for record in &table.rows {
            let mut query = sqlx::query(&insert);
            for (cell, kind) in record.iter().zip(&table.kinds) {
                let value = cell.as_deref();
                query = match kind {
                    ColumnKind::Integer => query.bind(value.and_then(|v| v.parse::<i64>().ok())),
                    ColumnKind::Real => query.bind(value.and_then(|v| v.parse::<f64>().ok())),
                    ColumnKind::Text => query.bind(value.map(str::to_string)),
                };
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(table.rows.len() as u64)
    }

    /// Row count per table
    pub async fn row_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for table in self.table_names().await? {
            let rows = self.count_rows(&table).await?;
            counts.insert(table, rows);
        }
        Ok(counts)
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(&self.reader)
            .await
            .with_context(|| format!("Failed to count rows of {}", table))?;
        Ok(count.max(0) as u64)
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;
        debug!("WAL flushed");
        Ok(())
    }

    /// Flush and close every pooled connection
    pub async fn close(self) -> Result<()> {
        self.flush_wal().await?;
        self.reader.close().await;
        self.pool.close().await;
        info!("Database connection closed");
        Ok(())
    }
}

#[async_trait]
impl TabularBackend for SqliteBackend {
    async fn run_query(&self, sql: &str) -> Result<ResultSet> {
        let rows = sqlx::query(sql).fetch_all(&self.reader).await?;

        let columns = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            // No rows to read names from; ask the prepared statement instead
            None => match (&self.reader).describe(sql).await {
                Ok(described) => described
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
                Err(_) => Vec::new(),
            },
        };

        let rows = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(ResultSet::new(columns, rows))
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .fetch_all(&self.reader)
        .await
        .context("Failed to list tables")?;
        Ok(names)
    }

    async fn table_schema(&self, table: &str, sample_rows: usize) -> Result<TableSchema> {
        let info = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.reader)
            .await
            .with_context(|| format!("Failed to read columns of {}", table))?;

        let columns = info
            .iter()
            .map(|row| -> Result<ColumnInfo> {
                let data_type: String = row.try_get("type")?;
                let not_null: i64 = row.try_get("notnull")?;
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    data_type: if data_type.is_empty() {
                        "ANY".to_string()
                    } else {
                        data_type
                    },
                    nullable: not_null == 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let row_count = self.count_rows(table).await?;
        let sample = self
            .run_query(&format!(
                "SELECT * FROM {} LIMIT {}",
                quote_ident(table),
                sample_rows
            ))
            .await?;

        Ok(TableSchema {
            name: table.to_string(),
            columns,
            row_count,
            sample,
        })
    }
}

/// Double-quote an identifier for interpolation into SQL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

/// Map a SQLite value to a JSON scalar by its storage class.
fn decode_value(row: &SqliteRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();

    let value = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(idx)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get_unchecked(idx)?;
            Value::String(format!("<{} bytes>", bytes.len()))
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SEED: &str = r#"
        CREATE TABLE orders (
            order_id TEXT NOT NULL,
            category TEXT,
            price REAL NOT NULL,
            quantity INTEGER
        );
        INSERT INTO orders VALUES ('o1', 'toys', 10.5, 2);
        INSERT INTO orders VALUES ('o2', 'books', 20.0, NULL);
        INSERT INTO orders VALUES ('o3', 'toys', 5.0, 1);
        INSERT INTO orders VALUES ('o4', NULL, 7.25, 3);
    "#;

    #[tokio::test]
    async fn test_load_script_reports_row_counts() {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteBackend::connect(&temp_dir.path().join("store.db"))
            .await
            .unwrap();

        let counts = backend.load_script(SEED).await.unwrap();
        assert_eq!(counts.get("orders"), Some(&4));

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_query_decodes_scalars() {
        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        backend.load_script(SEED).await.unwrap();

        let result = backend
            .run_query("SELECT order_id, category, price, quantity FROM orders ORDER BY order_id")
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["order_id", "category", "price", "quantity"]);
        assert_eq!(result.rows[0], vec![json!("o1"), json!("toys"), json!(10.5), json!(2)]);
        assert_eq!(result.rows[1][3], Value::Null);
        assert_eq!(result.rows[3][1], Value::Null);
    }

    #[tokio::test]
    async fn test_empty_result_keeps_column_names() {
        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        backend.load_script(SEED).await.unwrap();

        let result = backend
            .run_query("SELECT category, price FROM orders WHERE price > 1000")
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(result.columns, vec!["category", "price"]);
    }

    #[tokio::test]
    async fn test_table_schema() {
        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        backend.load_script(SEED).await.unwrap();

        assert_eq!(backend.table_names().await.unwrap(), vec!["orders"]);

        let schema = backend.table_schema("orders", 3).await.unwrap();
        assert_eq!(schema.row_count, 4);
        assert_eq!(schema.sample.row_count(), 3);
        assert_eq!(schema.columns.len(), 4);
        assert_eq!(schema.columns[0].name, "order_id");
        assert!(!schema.columns[0].nullable);
        assert_eq!(schema.columns[2].data_type, "REAL");
        assert!(schema.columns[1].nullable);
    }

    #[tokio::test]
    async fn test_invalid_sql_is_an_error() {
        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        backend.load_script(SEED).await.unwrap();

        let err = backend
            .run_query("SELECT revenue FROM orders")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("revenue"));
    }

    #[tokio::test]
    async fn test_reader_refuses_writes() {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteBackend::connect(&temp_dir.path().join("store.db"))
            .await
            .unwrap();
        backend.load_script(SEED).await.unwrap();

        for sql in [
            "REPLACE INTO orders VALUES ('o1', 'toys', 999.0, 2)",
            "UPDATE orders SET price = 0",
            "CREATE TABLE t (a)",
        ] {
            assert!(backend.run_query(sql).await.is_err(), "{}", sql);
        }

        let result = backend
            .run_query("SELECT COUNT(*) FROM orders WHERE price = 10.5")
            .await
            .unwrap();
        assert_eq!(result.rows[0][0], json!(1));
        assert!(backend.run_query("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_reader_refuses_writes() {
        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        backend.load_script(SEED).await.unwrap();

        assert!(backend.run_query("DELETE FROM orders").await.is_err());
        assert_eq!(backend.row_counts().await.unwrap().get("orders"), Some(&4));
    }

    #[tokio::test]
    async fn test_load_csv_file_creates_typed_table() {
        let temp_dir = TempDir::new().unwrap();
        let csv_path = temp_dir.path().join("olist_order_payments_dataset.csv");
        std::fs::write(
            &csv_path,
            "order_id,payment_type,payment_installments,payment_value\n\
             o1,credit_card,3,99.9\n\
             o2,boleto,1,\n",
        )
        .unwrap();

        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        let (table, rows) = backend.load_csv_file(&csv_path).await.unwrap();
        assert_eq!(table, "order_payments");
        assert_eq!(rows, 2);

        let schema = backend.table_schema("order_payments", 5).await.unwrap();
        let types: Vec<&str> = schema.columns.iter().map(|c| c.data_type.as_str()).collect();
        assert_eq!(types, vec!["TEXT", "TEXT", "INTEGER", "REAL"]);

        let result = backend
            .run_query("SELECT payment_installments, payment_value FROM order_payments ORDER BY order_id")
            .await
            .unwrap();
        assert_eq!(result.rows[0], vec![json!(3), json!(99.9)]);
        assert_eq!(result.rows[1][1], Value::Null);

        // Loading again replaces the table
        std::fs::write(&csv_path, "order_id,payment_value\no9,1.0\n").unwrap();
        let (_, rows) = backend.load_csv_file(&csv_path).await.unwrap();
        assert_eq!(rows, 1);
        assert_eq!(backend.row_counts().await.unwrap().get("order_payments"), Some(&1));
    }

    #[tokio::test]
    async fn test_load_csv_dir_skips_bad_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("customers.csv"), "id,city\nc1,rio\nc2,sp\n").unwrap();
        std::fs::write(temp_dir.path().join("empty.csv"), "").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let backend = SqliteBackend::connect_in_memory().await.unwrap();
        let loaded = backend.load_csv_dir(temp_dir.path()).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("customers"), Some(&2));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
