use std::sync::Arc;
use tabula_engine::app;
use tabula_engine::store::{QueryPolicy, SqliteBackend, TabularBackend, TabularStore};
use tempfile::TempDir;

const SEED: &str = r#"
CREATE TABLE customers (customer_id TEXT PRIMARY KEY, city TEXT, state TEXT);
CREATE TABLE payments (order_id TEXT NOT NULL, payment_type TEXT, payment_value REAL);
INSERT INTO customers VALUES ('c1', 'sao paulo', 'SP'), ('c2', 'rio', 'RJ'), ('c3', 'campinas', 'SP');
INSERT INTO payments VALUES ('o1', 'credit_card', 10.5), ('o2', 'boleto', 99.0),
    ('o3', 'credit_card', 42.0), ('o4', 'voucher', NULL);
"#;

async fn seeded_store(dir: &TempDir, max_results: usize) -> (Arc<SqliteBackend>, TabularStore) {
    let backend = Arc::new(
        SqliteBackend::connect(&dir.path().join("store.db"))
            .await
            .unwrap(),
    );
    let store = TabularStore::new(backend.clone(), max_results, 3).unwrap();
    let loaded = backend.load_script(SEED).await.unwrap();
    store.on_tables_loaded(&loaded).await.unwrap();
    (backend, store)
}

#[tokio::test]
async fn test_schema_snapshot_after_load() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = seeded_store(&dir, 1000).await;

    assert_eq!(store.table_names().await, vec!["customers", "payments"]);

    let stats = store.table_stats("payments").await.unwrap();
    assert_eq!(stats.row_count, 4);
    assert_eq!(stats.column_count, 3);
    assert!(!stats.columns[0].nullable);

    let description = store.schema_description().await;
    assert!(description.starts_with("# Database Schema"));
    assert!(description.contains("## Table: customers"));
    assert!(description.contains("  - payment_value (REAL) NULL"));
    assert!(store.table_stats("sellers").await.is_none());
}

#[tokio::test]
async fn test_every_mutating_keyword_is_refused() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = seeded_store(&dir, 1000).await;

    let attempts = [
        "DROP TABLE customers",
        "delete from payments",
        "UPDATE customers SET city = 'x'",
        "INSERT INTO customers VALUES ('c9', 'a', 'b')",
        "ALTER TABLE payments ADD COLUMN y",
        "CREATE TABLE t (a)",
        "TRUNCATE payments",
        "ATTACH DATABASE 'x.db' AS x",
        "PRAGMA writable_schema = ON",
        "SELECT 1; VACUUM",
        "REPLACE INTO customers VALUES ('c1', 'x', 'y')",
        "REINDEX customers",
        "ANALYZE",
    ];
    for sql in attempts {
        let err = store.execute(sql).await.unwrap_err();
        assert!(err.to_string().contains("dangerous"), "{}: {}", sql, err);
    }

    let count = store
        .execute("SELECT COUNT(*) FROM customers")
        .await
        .unwrap();
    assert_eq!(count.rows[0][0], serde_json::json!(3));
}

#[tokio::test]
async fn test_replace_into_cannot_change_data() {
    let dir = TempDir::new().unwrap();
    let (backend, store) = seeded_store(&dir, 1000).await;

    let err = store
        .execute("REPLACE INTO customers VALUES ('c1', 'x', 'y')")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("dangerous"));

    // Past the guard, the query connection itself refuses to write
    assert!(backend
        .run_query("REPLACE INTO customers VALUES ('c1', 'x', 'y')")
        .await
        .is_err());
    assert!(backend
        .run_query("INSERT OR REPLACE INTO payments VALUES ('o9', 'pix', 1.0)")
        .await
        .is_err());

    let city = store
        .execute("SELECT city FROM customers WHERE customer_id = 'c1'")
        .await
        .unwrap();
    assert_eq!(city.rows[0][0], serde_json::json!("sao paulo"));
    assert_eq!(store.table_stats("payments").await.unwrap().row_count, 4);

    let replaced = store
        .execute("SELECT replace(city, ' ', '_') AS slug FROM customers WHERE customer_id = 'c1'")
        .await
        .unwrap();
    assert_eq!(replaced.rows[0][0], serde_json::json!("sao_paulo"));
}

#[tokio::test]
async fn test_csv_file_is_loaded_and_queryable() {
    let dir = TempDir::new().unwrap();
    let (backend, store) = seeded_store(&dir, 1000).await;

    let csv_path = dir.path().join("olist_sellers_dataset.csv");
    std::fs::write(
        &csv_path,
        "seller_id,seller_city,seller_state,rating\n\
         s1,sao paulo,SP,4.5\n\
         s2,\"rio de janeiro\",RJ,\n\
         s3,curitiba,PR,3\n",
    )
    .unwrap();

    let loaded = app::load_seed(&backend, &store, &csv_path).await.unwrap();
    assert_eq!(loaded.get("sellers"), Some(&3));

    assert_eq!(
        store.table_names().await,
        vec!["customers", "payments", "sellers"]
    );
    let stats = store.table_stats("sellers").await.unwrap();
    assert_eq!(stats.row_count, 3);
    assert_eq!(stats.columns[3].data_type, "REAL");

    let result = store
        .execute("SELECT seller_city FROM sellers WHERE rating IS NULL")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0], serde_json::json!("rio de janeiro"));

    let per_state = store
        .execute("SELECT COUNT(*) FROM sellers WHERE seller_state = 'SP'")
        .await
        .unwrap();
    assert_eq!(per_state.rows[0][0], serde_json::json!(1));
}

#[tokio::test]
async fn test_csv_directory_is_loaded() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(
        data.join("olist_orders_dataset.csv"),
        "order_id,order_status\no1,delivered\no2,shipped\n",
    )
    .unwrap();
    std::fs::write(
        data.join("product_category_name_translation.csv"),
        "product_category_name,product_category_name_english\nbrinquedos,toys\n",
    )
    .unwrap();

    let backend = Arc::new(
        SqliteBackend::connect(&dir.path().join("store.db"))
            .await
            .unwrap(),
    );
    let store = TabularStore::new(backend.clone(), 1000, 3).unwrap();

    let loaded = app::load_seed(&backend, &store, &data).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(
        store.table_names().await,
        vec!["orders", "product_category_translation"]
    );

    let english = store
        .execute("SELECT product_category_name_english FROM product_category_translation")
        .await
        .unwrap();
    assert_eq!(english.rows[0][0], serde_json::json!("toys"));
}

#[tokio::test]
async fn test_keyword_inside_identifier_is_allowed() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = seeded_store(&dir, 1000).await;

    let result = store
        .execute("SELECT payment_type AS updated_type, COUNT(*) AS created_count FROM payments GROUP BY payment_type ORDER BY payment_type")
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["updated_type", "created_count"]);
    assert_eq!(result.row_count(), 3);
}

#[tokio::test]
async fn test_results_capped_at_limit() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = seeded_store(&dir, 2).await;

    let result = store.execute("SELECT * FROM payments").await.unwrap();
    assert_eq!(result.row_count(), 2);
    assert_eq!(result.rows[1][0], serde_json::json!("o2"));
}

#[tokio::test]
async fn test_invalid_sql_is_query_failure() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = seeded_store(&dir, 1000).await;

    let err = store.execute("SELECT nope FROM sellers").await.unwrap_err();
    assert!(err.to_string().starts_with("Query execution error:"));
}

#[tokio::test]
async fn test_empty_result_keeps_columns_and_nulls_decode() {
    let dir = TempDir::new().unwrap();
    let (_backend, store) = seeded_store(&dir, 1000).await;

    let empty = store
        .execute("SELECT city, state FROM customers WHERE state = 'AM'")
        .await
        .unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.columns, vec!["city", "state"]);

    let nulls = store
        .execute("SELECT payment_value FROM payments WHERE order_id = 'o4'")
        .await
        .unwrap();
    assert!(nulls.rows[0][0].is_null());
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (backend, _store) = seeded_store(&dir, 1000).await;
        backend.flush_wal().await.unwrap();
    }

    let backend = Arc::new(
        SqliteBackend::connect(&dir.path().join("store.db"))
            .await
            .unwrap(),
    );
    let store = TabularStore::new(backend, 1000, 3).unwrap();
    assert_eq!(store.rebuild_schema().await.unwrap(), 2);
    assert_eq!(store.table_stats("customers").await.unwrap().row_count, 3);
}

#[test]
fn test_policy_standalone() {
    let policy = QueryPolicy::new().unwrap();
    assert_eq!(
        policy.find_mutating_keyword("select * from t; drop table t"),
        Some("DROP")
    );
    assert!(policy.check("SELECT dropped_at FROM t").is_ok());
}
