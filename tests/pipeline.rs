mod common;

use anyhow::{Result, anyhow};
use common::{TestWorkspace, create_table_for, fast_config, load};
use csv_loader::{
    config::LoadConfig,
    events::{EventLevel, EventLogger, MemoryLogger},
    loader::{CancellationFlag, LoadResult},
    pipeline::{Pipeline, PreparedLoad},
    profile::ColumnProfile,
};
use rusqlite::Connection;
use serde_json::Value;

const ORDERS: &str = "order_id,customer,amount,paid,ordered_at\n\
1001,Ann,10.50,yes,2024-01-05\n\
1002,Bo,7,no,2024-01-06 09:30:00\n\
1003,\"Cy, Jr.\",12.25,Y,01/07/2024\n\
1004,Di,,0,2024-01-08T10:00:00Z\n";

#[test]
fn header_column_types_follow_observed_values() {
    let prepared = PreparedLoad::from_bytes(
        b"Id,Name,Amount\n1,Ann,10.5\n2,Bo,7\n",
        &LoadConfig::default(),
    )
    .expect("prepare");
    assert_eq!(prepared.profiles[0].profile, ColumnProfile::Integer);
    let ColumnProfile::Decimal { scale, .. } = prepared.profiles[2].profile else {
        panic!("Amount should be decimal: {:?}", prepared.profiles[2]);
    };
    assert!(scale >= 1);
}

#[test]
fn ragged_row_fails_before_the_sink_is_touched() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("ragged.db");
    let logger = MemoryLogger::new();

    let result = load(&sink, &fast_config(), &logger, "t", "A,B\n1,2,3\n");

    assert!(!result.success);
    assert_eq!(result.records_processed, 0);
    let error = result.error.expect("error summary");
    assert!(error.contains("header's 2 column(s)"), "{error}");
    assert!(error.contains("line 2 has 3 cell(s)"), "{error}");
    assert!(!sink.path().exists());
    assert_eq!(logger.count(EventLevel::Error), 1);
}

#[test]
fn every_ragged_line_is_reported() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("ragged.db");
    let result = load(
        &sink,
        &fast_config(),
        &MemoryLogger::new(),
        "t",
        "a,b\n1\n1,2\n1,2,3\n\n4,5,6,7\n",
    );
    let error = result.error.expect("error summary");
    assert!(error.contains("3 row(s)"), "{error}");
    for expected in ["line 2 has 1", "line 4 has 3", "line 6 has 4"] {
        assert!(error.contains(expected), "missing '{expected}' in {error}");
    }
}

#[test]
fn boolean_tokens_load_as_flags() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("flags.db");
    let config = fast_config();
    let content = "label,active\na,yes\nb,no\nc,Y\nd,0\n";
    let prepared = PreparedLoad::from_bytes(content.as_bytes(), &config).expect("prepare");
    assert_eq!(prepared.profiles[1].profile, ColumnProfile::Boolean);

    create_table_for(&sink, &config, "flags", content, &[]);
    let result = load(&sink, &config, &MemoryLogger::new(), "flags", content);
    assert!(result.success, "{:?}", result.error);

    let connection = Connection::open(sink.path()).expect("open db");
    let mut statement = connection
        .prepare("SELECT active FROM flags ORDER BY id")
        .expect("prepare select");
    let flags = statement
        .query_map([], |row| row.get::<_, i64>(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    assert_eq!(flags, vec![1, 0, 1, 0]);
}

#[test]
fn header_only_file_is_an_empty_success() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("empty.db");
    for content in ["Id,Name\n", "", "\n\n"] {
        let result = load(&sink, &fast_config(), &MemoryLogger::new(), "t", content);
        assert_eq!(result, LoadResult::empty());
        assert!(result.success);
        assert_eq!(result.records_processed, 0);
        assert_eq!(result.batches_processed, 0);
    }
    assert!(!sink.path().exists());
}

#[test]
fn reloading_a_committed_file_is_a_warned_no_op() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("orders.db");
    let config = LoadConfig {
        batch_size: 2,
        ..fast_config()
    };
    create_table_for(&sink, &config, "orders", ORDERS, &["order_id"]);

    let first = load(&sink, &config, &MemoryLogger::new(), "orders", ORDERS);
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.rows_written, 4);
    assert_eq!(first.batches_processed, 2);

    let logger = MemoryLogger::new();
    let second = load(&sink, &config, &logger, "orders", ORDERS);
    assert!(second.success, "{:?}", second.error);
    assert_eq!(second.records_processed, 4);
    assert_eq!(second.batches_processed, 2);
    assert_eq!(second.batches_skipped, 2);
    assert_eq!(second.rows_written, 0);
    assert_eq!(logger.count(EventLevel::Warning), 2);
    assert_eq!(sink.row_count("orders").expect("count"), 4);
}

#[test]
fn partially_duplicated_batch_is_skipped_whole() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("orders.db");
    let config = fast_config();
    create_table_for(&sink, &config, "orders", ORDERS, &["order_id"]);

    let first_two = ORDERS.lines().take(3).collect::<Vec<_>>().join("\n");
    assert!(load(&sink, &config, &MemoryLogger::new(), "orders", &first_two).success);

    let result = load(&sink, &config, &MemoryLogger::new(), "orders", ORDERS);
    assert!(result.success);
    assert_eq!(result.batches_skipped, 1);
    assert_eq!(result.rows_written, 0);
    assert_eq!(sink.row_count("orders").expect("count"), 2);
}

#[test]
fn typed_values_and_load_timestamp_reach_the_table() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("orders.db");
    let config = fast_config();
    create_table_for(&sink, &config, "orders", ORDERS, &[]);
    let result = load(&sink, &config, &MemoryLogger::new(), "orders", ORDERS);
    assert!(result.success, "{:?}", result.error);

    let connection = Connection::open(sink.path()).expect("open db");
    let (customer, amount, ordered_at, loaded_at): (String, f64, String, String) = connection
        .query_row(
            "SELECT customer, amount, ordered_at, loaded_at FROM orders WHERE order_id = 1003",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .expect("row 1003");
    assert_eq!(customer, "Cy, Jr.");
    assert!((amount - 12.25).abs() < f64::EPSILON);
    assert_eq!(ordered_at, "2024-01-07 00:00:00");
    assert!(!loaded_at.is_empty());

    let missing_amount: Option<f64> = connection
        .query_row("SELECT amount FROM orders WHERE order_id = 1004", [], |row| {
            row.get(0)
        })
        .expect("row 1004");
    assert_eq!(missing_amount, None);

    let distinct_loaded: i64 = connection
        .query_row("SELECT COUNT(DISTINCT loaded_at) FROM orders", [], |row| {
            row.get(0)
        })
        .expect("distinct load timestamps");
    assert_eq!(distinct_loaded, 1);
}

#[test]
fn reserved_columns_in_the_file_are_never_written() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("reserved.db");
    let config = fast_config();
    let content = "Id,CreatedAt,name\n99,2020-01-01,Ann\n98,2020-01-02,Bo\n";
    create_table_for(&sink, &config, "people", content, &[]);
    let result = load(&sink, &config, &MemoryLogger::new(), "people", content);
    assert!(result.success, "{:?}", result.error);

    let connection = Connection::open(sink.path()).expect("open db");
    let ids = connection
        .prepare("SELECT id FROM people ORDER BY id")
        .expect("prepare")
        .query_map([], |row| row.get::<_, i64>(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("ids");
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn fatal_batch_stops_the_load_and_keeps_earlier_commits() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("checked.db");
    sink.execute_script(
        "CREATE TABLE t (\
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            n BIGINT, \
            amount BIGINT CHECK (amount < 100), \
            loaded_at DATETIME);",
    )
    .expect("create table");
    let config = LoadConfig {
        batch_size: 2,
        max_retries: 1,
        ..fast_config()
    };
    let logger = MemoryLogger::new();

    let result = load(
        &sink,
        &config,
        &logger,
        "t",
        "n,amount\n1,10\n2,20\n3,150\n4,30\n5,40\n",
    );

    assert!(!result.success);
    assert_eq!(result.batches_processed, 1);
    assert_eq!(result.records_processed, 2);
    let error = result.error.expect("error summary");
    assert!(
        error.contains("Batch 2/3 (lines 4-5) failed after 2 attempt(s)"),
        "{error}"
    );
    assert_eq!(sink.row_count("t").expect("count"), 2);
    assert_eq!(logger.count(EventLevel::Warning), 1);
}

#[test]
fn missing_table_exhausts_retries() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("missing.db");
    let config = LoadConfig {
        max_retries: 2,
        ..fast_config()
    };
    let result = load(&sink, &config, &MemoryLogger::new(), "absent", "a\n1\n");
    assert!(!result.success);
    assert_eq!(result.batches_processed, 0);
    let error = result.error.expect("error summary");
    assert!(error.contains("failed after 3 attempt(s)"), "{error}");
    assert!(error.contains("no such table"), "{error}");
}

#[test]
fn identifier_collisions_fail_fast() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("collide.db");
    let result = load(
        &sink,
        &fast_config(),
        &MemoryLogger::new(),
        "t",
        "first name,first-name\nAnn,Bo\n",
    );
    assert!(!result.success);
    let error = result.error.expect("error summary");
    assert!(error.contains("first_name <- [first name, first-name]"), "{error}");
}

#[test]
fn cancelled_load_writes_nothing() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("cancel.db");
    let config = fast_config();
    create_table_for(&sink, &config, "orders", ORDERS, &[]);
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let result =
        Pipeline::new(&config, &sink).run("orders.csv", ORDERS.as_bytes(), "orders", &cancel);

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("Load cancelled before batch 1/1")
    );
    assert_eq!(sink.row_count("orders").expect("count"), 0);
}

struct OfflineLogger;

impl EventLogger for OfflineLogger {
    fn log(&self, _: EventLevel, _: &str, _: Option<&Value>) -> Result<()> {
        Err(anyhow!("collector offline"))
    }
}

#[test]
fn failing_event_logger_never_aborts_a_load() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("orders.db");
    let config = fast_config();
    create_table_for(&sink, &config, "orders", ORDERS, &[]);

    let result = Pipeline::new(&config, &sink)
        .with_logger(&OfflineLogger)
        .run("orders.csv", ORDERS.as_bytes(), "orders", &CancellationFlag::new());

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rows_written, 4);
}

#[test]
fn progress_events_cover_parse_profiles_and_batches() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("orders.db");
    let config = LoadConfig {
        batch_size: 3,
        ..fast_config()
    };
    create_table_for(&sink, &config, "orders", ORDERS, &[]);
    let logger = MemoryLogger::new();
    assert!(load(&sink, &config, &logger, "orders", ORDERS).success);

    let messages = logger
        .events()
        .into_iter()
        .map(|event| event.message)
        .collect::<Vec<_>>();
    assert_eq!(
        messages,
        vec![
            "Parse complete",
            "Column profiles computed",
            "Batch 1/2 committed",
            "Batch 2/2 committed",
            "Load complete",
        ]
    );
    let parse = &logger.events()[0];
    let details = parse.details.as_ref().expect("parse details");
    assert_eq!(details["records"], 4);
    assert_eq!(details["sha256"].as_str().map(str::len), Some(64));
}

#[test]
fn latin1_input_decodes_with_configured_encoding() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("latin.db");
    let config = LoadConfig {
        delimiter: ';',
        encoding: Some("windows-1252".to_string()),
        ..fast_config()
    };
    let content: &[u8] = b"city;pop\nM\xfcnchen;1500000\n";
    let prepared = PreparedLoad::from_bytes(content, &config).expect("prepare");
    assert_eq!(prepared.table.records[0].value(0), Some("München"));

    let result = Pipeline::new(&config, &sink).run(
        "latin.csv",
        content,
        "cities",
        &CancellationFlag::new(),
    );
    // No table was created, so the write fails; decoding did not.
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("no such table"));
}

#[test]
fn one_prepared_input_drives_ddl_and_load() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("orders.db");
    let config = fast_config();
    let prepared = PreparedLoad::from_bytes(ORDERS.as_bytes(), &config).expect("prepare");
    let sql = csv_loader::sink::render_create_table(
        "orders",
        &prepared.profiles,
        &prepared.columns,
        &config.load_timestamp_column,
        &[],
    )
    .expect("render ddl");
    sink.execute_script(&sql).expect("create table");

    let logger = MemoryLogger::new();
    let result = Pipeline::new(&config, &sink).with_logger(&logger).run_prepared(
        "orders.csv",
        &prepared,
        "orders",
        &CancellationFlag::new(),
    );
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rows_written, 4);
    assert_eq!(sink.row_count("orders").expect("count"), 4);
}

#[test]
fn rejected_input_is_reported_without_touching_the_sink() {
    let workspace = TestWorkspace::new();
    let sink = workspace.sqlite("ragged.db");
    let config = fast_config();
    let err = PreparedLoad::from_bytes(b"a,b\n1\n", &config).expect_err("ragged input");

    let logger = MemoryLogger::new();
    let result = Pipeline::new(&config, &sink)
        .with_logger(&logger)
        .reject("ragged.csv", &err);
    assert!(!result.success);
    assert!(result.error.expect("error").starts_with("ragged.csv: "));
    assert_eq!(logger.count(EventLevel::Error), 1);
    assert!(!sink.path().exists());
}
