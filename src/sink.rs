//! The relational sink seam.
//!
//! The loader only sees [`Sink`] and [`SinkConnection`]; the concrete store
//! lives behind them (see [`crate::sqlite`]). A connection writes one batch as
//! a single transaction and reports failures through [`SinkError`], whose
//! variants drive the loader's retry and idempotency decisions.

use std::fmt::Write as _;

use anyhow::{Result, bail};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    convert::TypedRecord,
    identifier::SanitizedColumnMap,
    profile::{ColumnMeta, ColumnProfile},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Statement failed: {0}")]
    Statement(String),
}

impl SinkError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, SinkError::DuplicateKey(_))
    }
}

/// Storage class a column is bound as. Every column value is nullable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkColumnType {
    Integer,
    Decimal,
    DateTime,
    Flag,
    Text,
}

impl From<&ColumnProfile> for SinkColumnType {
    fn from(profile: &ColumnProfile) -> Self {
        match profile {
            ColumnProfile::Integer => SinkColumnType::Integer,
            ColumnProfile::Decimal { .. } => SinkColumnType::Decimal,
            ColumnProfile::Timestamp => SinkColumnType::DateTime,
            ColumnProfile::Boolean => SinkColumnType::Flag,
            ColumnProfile::Text { .. } | ColumnProfile::UniqueIdentifier => SinkColumnType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkColumn {
    pub name: String,
    pub kind: SinkColumnType,
}

/// Target table and the columns every written row carries, in value order.
/// The load timestamp is always the last column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table: String,
    pub columns: Vec<SinkColumn>,
    pub load_timestamp_column: String,
}

impl TableLayout {
    pub fn new(
        table: &str,
        profiles: &[ColumnMeta],
        map: &SanitizedColumnMap,
        load_timestamp_column: &str,
    ) -> Self {
        let columns = map
            .columns()
            .iter()
            .map(|mapping| SinkColumn {
                name: mapping.sanitized.clone(),
                kind: SinkColumnType::from(&profiles[mapping.source_index].profile),
            })
            .collect();
        Self {
            table: table.to_string(),
            columns,
            load_timestamp_column: load_timestamp_column.to_string(),
        }
    }

    /// Values per row, load timestamp included.
    pub fn width(&self) -> usize {
        self.columns.len() + 1
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .map(|column| column.name.as_str())
            .chain(std::iter::once(self.load_timestamp_column.as_str()))
    }
}

pub trait Sink {
    type Connection: SinkConnection;

    /// Opens a fresh connection; it is released when dropped.
    fn connect(&self) -> Result<Self::Connection, SinkError>;
}

pub trait SinkConnection {
    /// Writes every row in one transaction and returns the number of rows
    /// inserted. On error nothing from this call is left applied.
    fn write_batch(&mut self, layout: &TableLayout, rows: &[TypedRecord])
    -> Result<usize, SinkError>;
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE TABLE` for the administrative step that precedes any load.
///
/// The table gets an auto-increment `id` key, a `created_at` default, one
/// column per sanitized source column, the load timestamp, and an optional
/// uniqueness constraint over `unique_columns` (original or sanitized names).
pub fn render_create_table(
    layout_table: &str,
    profiles: &[ColumnMeta],
    map: &SanitizedColumnMap,
    load_timestamp_column: &str,
    unique_columns: &[String],
) -> Result<String> {
    let mut sql = String::new();
    writeln!(
        sql,
        "CREATE TABLE IF NOT EXISTS {} (",
        quote_identifier(layout_table)
    )?;
    writeln!(sql, "    \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,")?;
    writeln!(
        sql,
        "    \"created_at\" DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,"
    )?;
    for mapping in map.columns() {
        writeln!(
            sql,
            "    {} {} NULL,",
            quote_identifier(&mapping.sanitized),
            profiles[mapping.source_index].profile.sql_type()
        )?;
    }
    write!(
        sql,
        "    {} DATETIME NULL",
        quote_identifier(load_timestamp_column)
    )?;

    if !unique_columns.is_empty() {
        let resolved = unique_columns
            .iter()
            .map(|name| {
                map.columns()
                    .iter()
                    .find(|mapping| &mapping.original == name || &mapping.sanitized == name)
                    .map(|mapping| quote_identifier(&mapping.sanitized))
                    .ok_or_else(|| name.clone())
            })
            .collect::<Vec<_>>();
        let unknown = resolved
            .iter()
            .filter_map(|entry| entry.as_ref().err())
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            bail!(
                "Unique column(s) not present in the load: {}",
                unknown.iter().join(", ")
            );
        }
        write!(
            sql,
            ",\n    UNIQUE ({})",
            resolved.into_iter().flatten().join(", ")
        )?;
    }
    sql.push_str("\n);\n");
    Ok(sql)
}
