//! Column-name sanitization and reserved-column filtering.

use std::{collections::BTreeMap, sync::OnceLock};

use itertools::Itertools;
use regex::Regex;
use thiserror::Error;

use crate::profile::ColumnMeta;

/// Columns owned by the target table; a file column with one of these names
/// is never written.
pub const RESERVED_COLUMNS: &[&str] = &["id", "created_at", "createdat", "row_version", "rowid"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error(
        "Columns sanitize to the same identifier: {}",
        .groups.iter().map(|(ident, names)| format!("{ident} <- [{}]", names.join(", "))).join("; ")
    )]
    Collision { groups: Vec<(String, Vec<String>)> },
    #[error("Invalid table name '{0}': use letters, digits and '_', not starting with a digit")]
    InvalidTableName(String),
    #[error("Invalid table name pattern: {0}")]
    Pattern(String),
}

/// Compiled table-name patterns, built once per process.
struct TableNameRules {
    valid: Regex,
    non_word: Regex,
}

impl TableNameRules {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            valid: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")?,
            non_word: Regex::new(r"[^A-Za-z0-9_]+")?,
        })
    }

    fn get() -> Result<&'static Self, IdentifierError> {
        static RULES: OnceLock<Result<TableNameRules, regex::Error>> = OnceLock::new();
        RULES
            .get_or_init(TableNameRules::new)
            .as_ref()
            .map_err(|err| IdentifierError::Pattern(err.to_string()))
    }
}

/// Replaces space, hyphen, period and slashes with `_`, and prefixes a leading
/// digit with `_`. Case and non-ASCII characters pass through unchanged.
pub fn sanitize(name: &str) -> String {
    let mut sanitized = name
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' | '/' | '\\' => '_',
            other => other,
        })
        .collect::<String>();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// Target table names are restricted to plain ASCII identifiers.
pub fn validate_table_name(name: &str) -> Result<(), IdentifierError> {
    if TableNameRules::get()?.valid.is_match(name) {
        Ok(())
    } else {
        Err(IdentifierError::InvalidTableName(name.to_string()))
    }
}

/// Derives a table name from a file stem such as `2024 Orders-EU`.
pub fn table_name_for(stem: &str) -> Result<String, IdentifierError> {
    let sanitized = sanitize(stem.trim());
    let collapsed = TableNameRules::get()?
        .non_word
        .replace_all(&sanitized, "_");
    let name = match collapsed.trim_matches('_') {
        "" => "imported".to_string(),
        name if name.starts_with(|c: char| c.is_ascii_digit()) => format!("_{name}"),
        name => name.to_string(),
    };
    Ok(name)
}

pub fn is_reserved(name: &str, extra_reserved: &[&str]) -> bool {
    let trimmed = name.trim();
    RESERVED_COLUMNS
        .iter()
        .chain(extra_reserved)
        .any(|reserved| reserved.eq_ignore_ascii_case(trimmed))
}

/// One source column that will be written to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source_index: usize,
    pub original: String,
    pub sanitized: String,
}

/// Original-to-sanitized column names, reserved columns excluded, in header
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizedColumnMap {
    columns: Vec<ColumnMapping>,
    dropped: Vec<String>,
}

impl SanitizedColumnMap {
    /// Filters reserved names, then sanitizes the rest. Two columns whose
    /// identifiers match case-insensitively fail the whole map.
    pub fn build(columns: &[ColumnMeta], extra_reserved: &[&str]) -> Result<Self, IdentifierError> {
        let mut map = SanitizedColumnMap::default();
        for (source_index, column) in columns.iter().enumerate() {
            if is_reserved(&column.name, extra_reserved) {
                map.dropped.push(column.name.clone());
                continue;
            }
            map.columns.push(ColumnMapping {
                source_index,
                original: column.name.clone(),
                sanitized: sanitize(&column.name),
            });
        }

        let mut by_identifier: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for mapping in &map.columns {
            by_identifier
                .entry(mapping.sanitized.to_lowercase())
                .or_default()
                .push(mapping.original.clone());
        }
        let groups = by_identifier
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .collect::<Vec<_>>();
        if !groups.is_empty() {
            return Err(IdentifierError::Collision { groups });
        }
        Ok(map)
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    /// Original names removed because they are reserved.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn sanitized_for(&self, original: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|mapping| mapping.original == original)
            .map(|mapping| mapping.sanitized.as_str())
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|mapping| mapping.sanitized.as_str())
    }
}
