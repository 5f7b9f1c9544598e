//! SQLite implementation of the relational sink.
//!
//! Each [`SqliteSink::connect`] opens a new connection with the configured
//! busy timeout. A batch is written inside one transaction using multi-row
//! `INSERT` statements of at most `bulk_batch_size` rows (fewer when the
//! column count would exceed SQLite's bound-parameter limit). Dropping the
//! transaction without committing rolls it back.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use itertools::Itertools;
use log::debug;
use rusqlite::{Connection, ErrorCode, ffi, params_from_iter, types::Value};

use crate::{
    convert::{TypedRecord, TypedValue, format_timestamp},
    sink::{Sink, SinkColumnType, SinkConnection, SinkError, TableLayout, quote_identifier},
};

/// Bound-parameter ceiling of the bundled SQLite build.
const MAX_BOUND_PARAMETERS: usize = 32_766;

#[derive(Debug, Clone)]
pub struct SqliteSink {
    path: PathBuf,
    busy_timeout: Duration,
    bulk_batch_size: usize,
}

impl SqliteSink {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration, bulk_batch_size: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            bulk_batch_size: bulk_batch_size.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs administrative SQL such as table creation.
    pub fn execute_script(&self, sql: &str) -> Result<(), SinkError> {
        let connection = self.open()?;
        connection.execute_batch(sql).map_err(classify)
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> Result<u64, SinkError> {
        let connection = self.open()?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        connection
            .query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|count| count.max(0) as u64)
            .map_err(classify)
    }

    fn open(&self) -> Result<Connection, SinkError> {
        let connection = Connection::open(&self.path)
            .map_err(|err| SinkError::Connection(format!("{:?}: {err}", self.path)))?;
        connection
            .busy_timeout(self.busy_timeout)
            .map_err(classify)?;
        Ok(connection)
    }
}

impl Sink for SqliteSink {
    type Connection = SqliteConnection;

    fn connect(&self) -> Result<SqliteConnection, SinkError> {
        debug!("Opening SQLite connection to {:?}", self.path);
        Ok(SqliteConnection {
            connection: self.open()?,
            bulk_batch_size: self.bulk_batch_size,
        })
    }
}

pub struct SqliteConnection {
    connection: Connection,
    bulk_batch_size: usize,
}

impl SinkConnection for SqliteConnection {
    fn write_batch(
        &mut self,
        layout: &TableLayout,
        rows: &[TypedRecord],
    ) -> Result<usize, SinkError> {
        let width = layout.width();
        let rows_per_statement = self
            .bulk_batch_size
            .min(MAX_BOUND_PARAMETERS / width)
            .max(1);

        let transaction = self.connection.transaction().map_err(classify)?;
        let mut written = 0;
        for chunk in rows.chunks(rows_per_statement) {
            let sql = insert_statement(layout, chunk.len());
            let mut statement = transaction.prepare_cached(&sql).map_err(classify)?;
            let params = chunk
                .iter()
                .flat_map(|record| bind_record(layout, record))
                .collect::<Vec<_>>();
            written += statement
                .execute(params_from_iter(params.iter()))
                .map_err(classify)?;
        }
        transaction.commit().map_err(classify)?;
        Ok(written)
    }
}

fn insert_statement(layout: &TableLayout, rows: usize) -> String {
    let placeholders = format!("({})", vec!["?"; layout.width()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(&layout.table),
        layout.column_names().map(quote_identifier).join(", "),
        std::iter::repeat_n(placeholders.as_str(), rows).join(", ")
    )
}

fn bind_record(layout: &TableLayout, record: &TypedRecord) -> Vec<Value> {
    layout
        .columns
        .iter()
        .zip(record.values())
        .map(|(column, value)| bind_value(column.kind, value))
        .chain(std::iter::once(Value::Text(format_timestamp(
            &record.loaded_at(),
        ))))
        .collect()
}

fn bind_value(kind: SinkColumnType, value: &TypedValue) -> Value {
    match (kind, value) {
        (_, TypedValue::Null) => Value::Null,
        (SinkColumnType::Integer, TypedValue::Integer(i)) => Value::Integer(*i),
        (SinkColumnType::Flag, TypedValue::Boolean(b)) => Value::Integer(i64::from(*b)),
        (SinkColumnType::DateTime, TypedValue::Timestamp(ts)) => Value::Text(format_timestamp(ts)),
        // Decimal text keeps every digit; the column's NUMERIC affinity
        // decides the stored representation.
        (SinkColumnType::Decimal, TypedValue::Decimal(d)) => Value::Text(d.to_string()),
        (_, other) => Value::Text(other.to_string()),
    }
}

fn classify(err: rusqlite::Error) -> SinkError {
    let message = err.to_string();
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation
                if matches!(
                    failure.extended_code,
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                ) =>
            {
                SinkError::DuplicateKey(message)
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => SinkError::Timeout(message),
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => SinkError::Connection(message),
            _ => SinkError::Statement(message),
        },
        _ => SinkError::Statement(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use tempfile::tempdir;

    use crate::sink::SinkColumn;

    fn layout() -> TableLayout {
        TableLayout {
            table: "orders".to_string(),
            columns: vec![
                SinkColumn {
                    name: "order_no".to_string(),
                    kind: SinkColumnType::Text,
                },
                SinkColumn {
                    name: "amount".to_string(),
                    kind: SinkColumnType::Decimal,
                },
                SinkColumn {
                    name: "paid".to_string(),
                    kind: SinkColumnType::Flag,
                },
            ],
            load_timestamp_column: "loaded_at".to_string(),
        }
    }

    fn record(order_no: &str) -> TypedRecord {
        let loaded_at = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        TypedRecord::new(
            2,
            vec![
                TypedValue::Text(order_no.to_string()),
                TypedValue::Decimal(Decimal::new(1050, 2)),
                TypedValue::Boolean(true),
            ],
            loaded_at,
        )
    }

    fn sink_with_table(dir: &Path, bulk_batch_size: usize) -> SqliteSink {
        let sink = SqliteSink::new(
            dir.join("load.db"),
            Duration::from_secs(1),
            bulk_batch_size,
        );
        sink.execute_script(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY AUTOINCREMENT, \
             order_no VARCHAR(50) UNIQUE, amount DECIMAL(18,2), paid BOOLEAN, loaded_at DATETIME);",
        )
        .unwrap();
        sink
    }

    #[test]
    fn insert_statement_repeats_placeholders_per_row() {
        let sql = insert_statement(&layout(), 2);
        assert_eq!(
            sql,
            "INSERT INTO \"orders\" (\"order_no\", \"amount\", \"paid\", \"loaded_at\") \
             VALUES (?, ?, ?, ?), (?, ?, ?, ?)"
        );
    }

    #[test]
    fn write_batch_commits_rows_across_statements() {
        let dir = tempdir().unwrap();
        let sink = sink_with_table(dir.path(), 2);
        let rows = ["A1", "A2", "A3", "A4", "A5"].map(record);
        let mut connection = sink.connect().unwrap();
        assert_eq!(connection.write_batch(&layout(), &rows).unwrap(), 5);
        assert_eq!(sink.row_count("orders").unwrap(), 5);

        let check = Connection::open(sink.path()).unwrap();
        let (amount, paid, loaded_at): (f64, i64, String) = check
            .query_row(
                "SELECT amount, paid, loaded_at FROM orders WHERE order_no = 'A3'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(amount, 10.5);
        assert_eq!(paid, 1);
        assert_eq!(loaded_at, "2024-01-01 12:00:00");
    }

    #[test]
    fn duplicate_rows_roll_back_the_whole_batch() {
        let dir = tempdir().unwrap();
        let sink = sink_with_table(dir.path(), 10);
        let mut connection = sink.connect().unwrap();
        connection.write_batch(&layout(), &[record("A1")]).unwrap();

        let err = connection
            .write_batch(&layout(), &[record("B1"), record("A1")])
            .unwrap_err();
        assert!(err.is_duplicate_key(), "unexpected error {err:?}");
        assert_eq!(sink.row_count("orders").unwrap(), 1);
    }

    #[test]
    fn missing_table_is_a_statement_error() {
        let dir = tempdir().unwrap();
        let sink = SqliteSink::new(dir.path().join("empty.db"), Duration::from_secs(1), 10);
        let mut connection = sink.connect().unwrap();
        let err = connection.write_batch(&layout(), &[record("A1")]).unwrap_err();
        assert!(matches!(err, SinkError::Statement(_)));
    }

    #[test]
    fn unique_identifiers_bind_as_text() {
        let id = uuid::Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            bind_value(SinkColumnType::Text, &TypedValue::UniqueIdentifier(id)),
            Value::Text("550e8400-e29b-41d4-a716-446655440000".to_string())
        );
        assert_eq!(
            bind_value(SinkColumnType::Integer, &TypedValue::Null),
            Value::Null
        );
    }
}
