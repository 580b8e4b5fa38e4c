//! Transaction lifecycle against the in-memory destination.

mod common;

use common::{connection_reset, permission_denied, MemoryDb};
use sql_bulk_load::core::{BindValue, InputColumn, InputType, SqlType};
use sql_bulk_load::{BulkLoader, InputSchema, OutputConfig, Record, TransactionPlan, Value};

fn output(yaml: &str) -> OutputConfig {
    let mut output: OutputConfig = serde_yaml::from_str(yaml).unwrap();
    output.retry_wait = 1;
    output.max_retry_wait = 5;
    output
}

fn input() -> InputSchema {
    InputSchema::new(vec![
        InputColumn {
            name: "id".into(),
            input_type: InputType::String,
        },
        InputColumn {
            name: "amount".into(),
            input_type: InputType::Long,
        },
        InputColumn {
            name: "note".into(),
            input_type: InputType::String,
        },
    ])
}

fn record(id: &str, amount: Option<i64>, note: &str) -> Record {
    vec![
        Value::String(id.into()),
        amount.map(Value::Long).unwrap_or(Value::Null),
        Value::String(note.into()),
    ]
}

fn text(s: &str) -> BindValue {
    BindValue::Text(s.into())
}

/// `items (id VARCHAR(8), amount BIGINT, note VARCHAR(16))` holding one old row.
fn items_db() -> MemoryDb {
    let db = MemoryDb::new();
    db.create_table(
        "items",
        &[("id", "VARCHAR(8)"), ("amount", "BIGINT"), ("note", "VARCHAR(16)")],
        &["id"],
    );
    db.insert_row("items", vec![text("OLD"), BindValue::I64(1), text("old")]);
    db
}

async fn load_all(loader: &BulkLoader, plan: &TransactionPlan, partitions: &[Vec<Record>]) -> u64 {
    let mut rows = 0;
    for (worker_index, records) in partitions.iter().enumerate() {
        let mut worker = loader.open(plan, worker_index).await.unwrap();
        worker.add_page(records).await.unwrap();
        rows += worker.finish().await.unwrap().rows;
    }
    rows
}

fn ids(db: &MemoryDb, table: &str) -> Vec<BindValue> {
    db.rows(table).into_iter().map(|r| r[0].clone()).collect()
}

#[tokio::test]
async fn test_truncate_insert_replaces_rows() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: truncate_insert}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    assert_eq!(plan.worker_tables().len(), 1);
    let rows = load_all(
        &loader,
        &plan,
        &[vec![record("A001", Some(12345), "abc"), record("A002", None, "xyz")]],
    )
    .await;
    assert_eq!(rows, 2);

    // Nothing is visible before commit.
    assert_eq!(ids(&db, "items"), vec![text("OLD")]);

    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();

    let rows = db.rows("items");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], vec![text("A001"), BindValue::I64(12345), text("abc")]);
    assert_eq!(rows[1][0], text("A002"));
    assert!(rows[1][1].is_null());
    assert_eq!(rows[1][2], text("xyz"));
    assert_eq!(db.table_names(), vec!["items".to_string()]);
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_insert_collects_every_worker_table() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert}"), None);

    let plan = loader.begin(&input(), 3).await.unwrap();
    let worker_tables = plan.worker_tables();
    assert_eq!(worker_tables.len(), 3);
    assert!(worker_tables[2].table.ends_with("_bl002"));

    load_all(
        &loader,
        &plan,
        &[
            vec![record("A001", Some(1), "a")],
            vec![record("A002", Some(2), "b"), record("A003", Some(3), "c")],
            vec![],
        ],
    )
    .await;
    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();

    assert_eq!(
        ids(&db, "items"),
        vec![text("A001"), text("A002"), text("A003"), text("OLD")]
    );
    assert!(worker_tables.iter().all(|t| !db.has_table(&t.table)));
}

#[tokio::test]
async fn test_insert_direct_writes_at_once() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert_direct}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    assert!(plan.worker_tables().is_empty());
    assert_eq!(plan.load_table(0), plan.actual_table);

    load_all(&loader, &plan, &[vec![record("A001", Some(1), "a")]]).await;
    assert_eq!(ids(&db, "items"), vec![text("A001"), text("OLD")]);

    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();
    assert_eq!(db.table_names(), vec!["items".to_string()]);
}

#[tokio::test]
async fn test_replace_swaps_in_new_table() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: replace}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    let swap = plan.swap_table.clone().unwrap();
    assert!(db.has_table(&swap.table));

    load_all(&loader, &plan, &[vec![record("A001", Some(7), "new")]]).await;
    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();

    assert!(!db.has_table(&swap.table));
    assert_eq!(db.table_names(), vec!["items".to_string()]);
    // The old definition is gone; the table was rebuilt from the input schema.
    assert_eq!(db.column_type("items", "id"), "CLOB");
    assert_eq!(
        db.rows("items"),
        vec![vec![text("A001"), BindValue::I64(7), text("new")]]
    );
}

#[tokio::test]
async fn test_replace_creates_missing_target() {
    let db = MemoryDb::new();
    let loader = BulkLoader::new(db.connector(), output("{table: fresh, mode: replace}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", None, "x")]]).await;
    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();

    assert_eq!(db.table_names(), vec!["fresh".to_string()]);
    assert_eq!(db.rows("fresh").len(), 1);
}

#[tokio::test]
async fn test_failed_replace_leaves_target_untouched() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: replace}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", Some(7), "new")]]).await;

    // The drop succeeds, the rename fails, the transaction rolls back.
    db.fail_next(&["ALTER TABLE"], 1, permission_denied);
    assert!(loader.commit(&plan).await.is_err());

    assert_eq!(db.column_type("items", "id"), "VARCHAR(8)");
    assert_eq!(ids(&db, "items"), vec![text("OLD")]);
    let swap = plan.swap_table.clone().unwrap();
    assert!(db.has_table(&swap.table));

    loader.cleanup(&plan).await.unwrap();
    assert_eq!(db.table_names(), vec!["items".to_string()]);
    assert_eq!(ids(&db, "items"), vec![text("OLD")]);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert}"), None);

    let plan = loader.begin(&input(), 2).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", Some(1), "a")], vec![]]).await;
    loader.commit(&plan).await.unwrap();

    loader.cleanup(&plan).await.unwrap();
    let after_first = db.table_names();
    loader.cleanup(&plan).await.unwrap();
    assert_eq!(db.table_names(), after_first);
    assert_eq!(after_first, vec!["items".to_string()]);
}

#[tokio::test]
async fn test_commit_retries_transient_failures() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: truncate_insert}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", Some(1), "a")]]).await;

    db.fail_next(&["INSERT INTO \"items\""], 3, connection_reset);
    loader.commit(&plan).await.unwrap();

    assert_eq!(db.pending_faults(), 0);
    // Every failed attempt rolled back its DELETE, the fourth one committed once.
    assert_eq!(ids(&db, "items"), vec![text("A001")]);
}

#[tokio::test]
async fn test_commit_gives_up_after_retry_limit() {
    let db = items_db();
    let mut config = output("{table: items, mode: insert}");
    config.retry_limit = 2;
    let loader = BulkLoader::new(db.connector(), config, None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", Some(1), "a")]]).await;

    db.fail_next(&["INSERT INTO \"items\""], 5, connection_reset);
    let err = loader.commit(&plan).await.unwrap_err();
    assert!(err.to_string().contains("Giving up after 3 attempts"));
    assert_eq!(db.pending_faults(), 2);
    assert_eq!(ids(&db, "items"), vec![text("OLD")]);
}

#[tokio::test]
async fn test_non_retryable_commit_failure_is_immediate() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", Some(1), "a")]]).await;

    db.fail_next(&["INSERT INTO \"items\""], 2, permission_denied);
    assert!(loader.commit(&plan).await.is_err());
    assert_eq!(db.pending_faults(), 1);
}

#[tokio::test]
async fn test_flush_when_batch_exceeds_limit() {
    let db = items_db();
    let mut config = output("{table: items, mode: insert_direct}");
    config.batch_size = 1;
    let loader = BulkLoader::new(db.connector(), config, None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    let mut worker = loader.open(&plan, 0).await.unwrap();

    worker.add(&record("A001", Some(1), "a")).await.unwrap();
    assert_eq!(db.batch_calls(), 0);
    let one_row = worker.batch_weight();
    assert!(one_row > 1);

    worker.add(&record("A002", Some(2), "b")).await.unwrap();
    assert_eq!(db.batch_calls(), 1);
    assert_eq!(worker.batch_weight(), one_row);

    worker.add(&record("A003", Some(3), "c")).await.unwrap();
    assert_eq!(db.batch_calls(), 2);

    let report = worker.finish().await.unwrap();
    assert_eq!(report.rows, 3);
    assert_eq!(db.batch_calls(), 3);
    assert_eq!(db.rows("items").len(), 4);
}

#[tokio::test]
async fn test_small_batches_wait_for_finish() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert_direct}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    let mut worker = loader.open(&plan, 0).await.unwrap();
    for i in 0..10 {
        worker.add(&record(&format!("A{:03}", i), Some(i), "x")).await.unwrap();
    }
    assert_eq!(db.batch_calls(), 0);

    worker.flush().await.unwrap();
    assert_eq!(worker.batch_weight(), 0);
    worker.finish().await.unwrap();
    assert_eq!(db.batch_calls(), 1);
}

#[tokio::test]
async fn test_worker_flush_retries_outside_direct_modes() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    let mut worker = loader.open(&plan, 0).await.unwrap();
    worker.add(&record("A001", Some(1), "a")).await.unwrap();

    db.fail_next(&["INSERT INTO", "_bl000"], 2, connection_reset);
    worker.finish().await.unwrap();
    assert_eq!(db.pending_faults(), 0);
    assert_eq!(db.rows(&plan.load_table(0).table).len(), 1);
}

#[tokio::test]
async fn test_direct_flush_failure_is_not_retried() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert_direct}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    let mut worker = loader.open(&plan, 0).await.unwrap();
    worker.add(&record("A001", Some(1), "a")).await.unwrap();

    db.fail_next(&["INSERT INTO \"items\""], 1, connection_reset);
    assert!(worker.finish().await.is_err());
    assert_eq!(ids(&db, "items"), vec![text("OLD")]);
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_merge_updates_and_inserts() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: merge}"), None);

    let plan = loader.begin(&input(), 2).await.unwrap();
    assert_eq!(plan.merge.as_ref().unwrap().merge_keys, vec!["id".to_string()]);

    load_all(
        &loader,
        &plan,
        &[
            vec![record("OLD", Some(99), "updated")],
            vec![record("A001", Some(1), "a")],
        ],
    )
    .await;
    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();

    assert_eq!(
        db.rows("items"),
        vec![
            vec![text("A001"), BindValue::I64(1), text("a")],
            vec![text("OLD"), BindValue::I64(99), text("updated")],
        ]
    );
}

#[tokio::test]
async fn test_merge_direct_upserts_each_row() {
    let db = items_db();
    let loader = BulkLoader::new(
        db.connector(),
        output("{table: items, mode: merge_direct, merge_keys: [id]}"),
        None,
    );

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(
        &loader,
        &plan,
        &[vec![record("OLD", Some(2), "again"), record("A001", None, "a")]],
    )
    .await;
    loader.commit(&plan).await.unwrap();

    let rows = db.rows("items");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1], vec![text("OLD"), BindValue::I64(2), text("again")]);
    assert_eq!(rows[0][1], BindValue::Null(SqlType::BigInt));
}

#[tokio::test]
async fn test_merge_requires_keys() {
    let db = MemoryDb::new();
    db.create_table("nokey", &[("id", "VARCHAR(8)")], &[]);
    let loader = BulkLoader::new(db.connector(), output("{table: nokey, mode: merge}"), None);

    let schema = InputSchema::new(vec![InputColumn {
        name: "id".into(),
        input_type: InputType::String,
    }]);
    let err = loader.begin(&schema, 1).await.unwrap_err();
    assert!(err.to_string().contains("does not have primary keys"));
}

#[tokio::test]
async fn test_table_name_resolves_case() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: ITEMS, mode: insert_direct}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    assert_eq!(plan.actual_table.table, "items");
}

#[tokio::test]
async fn test_unmatched_input_columns_are_skipped() {
    let db = MemoryDb::new();
    db.create_table("narrow", &[("id", "VARCHAR(8)"), ("note", "VARCHAR(16)")], &[]);
    let loader = BulkLoader::new(db.connector(), output("{table: narrow, mode: insert}"), None);

    let plan = loader.begin(&input(), 1).await.unwrap();
    assert!(plan.target_schema.columns[1].is_skip());

    load_all(&loader, &plan, &[vec![record("A001", Some(5), "kept")]]).await;
    loader.commit(&plan).await.unwrap();
    loader.cleanup(&plan).await.unwrap();
    assert_eq!(db.rows("narrow"), vec![vec![text("A001"), text("kept")]]);
}

#[tokio::test]
async fn test_worker_index_out_of_range() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert}"), None);

    let plan = loader.begin(&input(), 2).await.unwrap();
    assert!(loader.open(&plan, 2).await.is_err());
    loader.cleanup(&plan).await.unwrap();
}

#[tokio::test]
async fn test_retried_begin_reuses_swap_table() {
    let db = items_db();
    let loader = BulkLoader::new(db.connector(), output("{table: items, mode: replace}"), None);

    // The first attempt creates the swap table, then loses its connection.
    db.fail_next(&["DESCRIBE items_"], 1, connection_reset);
    let plan = loader.begin(&input(), 1).await.unwrap();
    assert_eq!(db.pending_faults(), 0);

    let swap = plan.swap_table.clone().unwrap();
    assert_eq!(
        db.table_names(),
        vec!["items".to_string(), swap.table.clone()]
    );

    loader.cleanup(&plan).await.unwrap();
    assert_eq!(db.table_names(), vec!["items".to_string()]);
}

#[tokio::test]
async fn test_repeated_replace_commit_runs_after_load() {
    let db = items_db();
    db.create_table("audit", &[("id", "VARCHAR(8)")], &[]);
    db.insert_row("audit", vec![text("stale")]);
    let loader = BulkLoader::new(
        db.connector(),
        output(r#"{table: items, mode: replace, after_load: 'DELETE FROM "audit"'}"#),
        None,
    );

    let plan = loader.begin(&input(), 1).await.unwrap();
    load_all(&loader, &plan, &[vec![record("A001", Some(7), "new")]]).await;
    loader.commit(&plan).await.unwrap();
    assert!(db.rows("audit").is_empty());

    // A second commit finds the swap already done and still runs after_load.
    db.insert_row("audit", vec![text("again")]);
    loader.commit(&plan).await.unwrap();
    assert!(db.rows("audit").is_empty());
    assert_eq!(ids(&db, "items"), vec![text("A001")]);

    loader.cleanup(&plan).await.unwrap();
    assert_eq!(
        db.table_names(),
        vec!["audit".to_string(), "items".to_string()]
    );
}

#[tokio::test]
async fn test_page_flushes_at_twice_the_limit_and_at_page_end() {
    let db = items_db();
    let sizing_loader = BulkLoader::new(db.connector(), output("{table: items, mode: insert_direct}"), None);
    let plan = sizing_loader.begin(&input(), 1).await.unwrap();
    let mut sizing = sizing_loader.open(&plan, 0).await.unwrap();
    sizing.add(&record("A001", Some(1), "a")).await.unwrap();
    let one_row = sizing.batch_weight();
    sizing.abort().await;

    let mut config = output("{table: items, mode: insert_direct}");
    config.batch_size = one_row;
    let loader = BulkLoader::new(db.connector(), config, None);
    let mut worker = loader.open(&plan, 0).await.unwrap();

    // Three equal rows never pass twice the limit inside the page, so the
    // only flush is the one at the end of the page.
    worker
        .add_page(&[
            record("A001", Some(1), "a"),
            record("A002", Some(2), "b"),
            record("A003", Some(3), "c"),
        ])
        .await
        .unwrap();
    assert_eq!(db.batch_calls(), 1);
    assert_eq!(worker.batch_weight(), 0);

    worker.finish().await.unwrap();
    assert_eq!(db.batch_calls(), 1);
    assert_eq!(db.rows("items").len(), 4);
}
