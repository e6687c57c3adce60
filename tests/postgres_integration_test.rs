// ABOUTME: Integration tests for the PostgreSQL row stream against a live database
// ABOUTME: Requires TEST_SOURCE_URL; run with `cargo test -- --ignored`

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use futures::TryStreamExt;
use serde_json::json;
use watermark_sync::source::executor;
use watermark_sync::source::{
    ParamValue, PostgresSource, QueryBinder, QueryTemplate, Row, RowSource, SourceOptions,
};
use watermark_sync::watermark::ResolvedWatermark;

/// Helper to get the test database URL from environment
fn get_test_url() -> Option<String> {
    env::var("TEST_SOURCE_URL").ok()
}

async fn setup_table(source: &PostgresSource, table: &str) -> anyhow::Result<()> {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{table}";
        CREATE TABLE "public"."{table}" (
            "ID" BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            price NUMERIC(10, 2),
            active BOOLEAN DEFAULT true,
            payload JSONB,
            created_at TIMESTAMPTZ DEFAULT '2024-01-02T03:04:05Z'
        );
        INSERT INTO "public"."{table}" ("ID", name, price, payload) VALUES
            (1, 'one', 1.50, '{{"k": 1}}'),
            (2, 'two', 2.00, NULL),
            (3, 'three', NULL, '[1, 2]'),
            (4, 'four', 4.25, NULL),
            (5, 'five', 5.00, NULL);
        "#
    );
    source.client().batch_execute(&ddl).await?;
    Ok(())
}

async fn cleanup_table(source: &PostgresSource, table: &str) {
    let ddl = format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table);
    let _ = source.client().batch_execute(&ddl).await;
}

async fn collect(
    source: &mut PostgresSource,
    binder: &QueryBinder,
    watermark: ResolvedWatermark,
) -> Vec<Row> {
    let query = binder.bind(&watermark).unwrap();
    let stream = source.execute(&query).await.unwrap();
    stream.try_collect().await.unwrap()
}

#[tokio::test]
#[ignore]
async fn test_streams_rows_after_watermark_in_small_batches() {
    let Some(url) = get_test_url() else {
        eprintln!("Skipping: TEST_SOURCE_URL not set");
        return;
    };

    let table = "watermark_sync_stream_test";
    let mut source = PostgresSource::connect(
        &url,
        SourceOptions {
            fetch_size: 2,
            lowercase_column_names: true,
        },
    )
    .await
    .unwrap();
    setup_table(&source, table).await.unwrap();

    let template = QueryTemplate::compile(&format!(
        r#"SELECT "ID", name, price, active, payload, created_at FROM "public"."{}"
           WHERE "ID" > :sql_last_value AND name <> :skip_name ORDER BY "ID""#,
        table
    ))
    .unwrap();
    let mut parameters = BTreeMap::new();
    parameters.insert("skip_name".to_string(), ParamValue::Text("four".to_string()));
    let binder = QueryBinder::new(template, parameters, 0).unwrap();

    let rows = collect(&mut source, &binder, ResolvedWatermark::Fresh).await;
    let ids: Vec<_> = rows.iter().map(|r| r.get("id").cloned().unwrap()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3), json!(5)]);

    let first = &rows[0];
    assert_eq!(first.get("name"), Some(&json!("one")));
    assert_eq!(first.get("price"), Some(&json!(1.5)));
    assert_eq!(first.get("active"), Some(&json!(true)));
    assert_eq!(first.get("payload"), Some(&json!({"k": 1})));
    assert_eq!(first.get("created_at"), Some(&json!("2024-01-02T03:04:05+00:00")));
    assert_eq!(rows[2].get("price"), Some(&json!(null)));

    let rows = collect(&mut source, &binder, ResolvedWatermark::Value(3)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!(5)));

    let rows = collect(&mut source, &binder, ResolvedWatermark::Value(5)).await;
    assert!(rows.is_empty());

    cleanup_table(&source, table).await;
}

#[tokio::test]
#[ignore]
async fn test_statement_runs_read_only() {
    let Some(url) = get_test_url() else {
        eprintln!("Skipping: TEST_SOURCE_URL not set");
        return;
    };

    let mut source = PostgresSource::connect(&url, SourceOptions::default())
        .await
        .unwrap();
    let template = QueryTemplate::compile(
        "CREATE TABLE watermark_sync_should_not_exist AS SELECT :sql_last_value AS v",
    )
    .unwrap();
    let binder = QueryBinder::new(template, BTreeMap::new(), 0).unwrap();
    let query = binder.bind(&ResolvedWatermark::Fresh).unwrap();

    let result = match source.execute(&query).await {
        Ok(stream) => stream.try_collect::<Vec<Row>>().await.map(|_| ()),
        Err(e) => Err(e),
    };
    assert!(result.is_err());
}

#[tokio::test]
#[ignore]
async fn test_reconnects_after_backend_is_terminated() {
    let Some(url) = get_test_url() else {
        eprintln!("Skipping: TEST_SOURCE_URL not set");
        return;
    };

    let mut source = PostgresSource::connect(&url, SourceOptions::default())
        .await
        .unwrap();
    let template = QueryTemplate::compile(
        "SELECT g AS seq FROM generate_series(1, 3) AS g WHERE g > :sql_last_value ORDER BY g",
    )
    .unwrap();
    let binder = QueryBinder::new(template, BTreeMap::new(), 0).unwrap();
    assert_eq!(collect(&mut source, &binder, ResolvedWatermark::Fresh).await.len(), 3);

    let pid: i32 = source
        .client()
        .query_one("SELECT pg_backend_pid()", &[])
        .await
        .unwrap()
        .get(0);
    let (admin, _connection) = executor::connect(&url).await.unwrap();
    admin
        .execute("SELECT pg_terminate_backend($1)", &[&pid])
        .await
        .unwrap();

    for _ in 0..50 {
        if source.client().is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(source.client().is_closed());

    let rows = collect(&mut source, &binder, ResolvedWatermark::Value(1)).await;
    assert_eq!(rows.len(), 2);
    assert!(!source.client().is_closed());
}
