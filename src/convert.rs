use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    identifier::SanitizedColumnMap,
    parser::RawRecord,
    profile::{ColumnMeta, ColumnProfile, decimal_digits},
};

/// Layouts with an explicit offset; values are normalised to UTC.
const ZONED_LAYOUTS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

const DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%d.%m.%Y"];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Failed to parse '{value}' as {target}")]
pub struct ConversionError {
    pub value: String,
    pub target: &'static str,
}

impl ConversionError {
    fn new(value: &str, target: &'static str) -> Self {
        Self {
            value: value.to_string(),
            target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Timestamp(NaiveDateTime),
    Boolean(bool),
    UniqueIdentifier(Uuid),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Null => f.write_str("NULL"),
            TypedValue::Text(s) => f.write_str(s),
            TypedValue::Integer(i) => write!(f, "{i}"),
            TypedValue::Decimal(d) => write!(f, "{d}"),
            TypedValue::Timestamp(ts) => write!(f, "{}", format_timestamp(ts)),
            TypedValue::Boolean(b) => write!(f, "{b}"),
            TypedValue::UniqueIdentifier(id) => write!(f, "{}", id.hyphenated()),
        }
    }
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

pub fn parse_unique_identifier(value: &str) -> Result<Uuid, ConversionError> {
    // Only the 36-character hyphenated form; `Uuid::parse_str` also takes
    // simple, braced and URN forms, which differ in length.
    if value.len() != 36 {
        return Err(ConversionError::new(value, "unique identifier"));
    }
    Uuid::parse_str(value).map_err(|_| ConversionError::new(value, "unique identifier"))
}

pub fn parse_boolean(value: &str) -> Result<bool, ConversionError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Ok(true),
        "false" | "no" | "n" | "0" => Ok(false),
        _ => Err(ConversionError::new(value, "boolean")),
    }
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, ConversionError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.naive_utc());
    }
    for layout in ZONED_LAYOUTS {
        if let Ok(parsed) = DateTime::parse_from_str(value, layout) {
            return Ok(parsed.naive_utc());
        }
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, layout) {
            return Ok(parsed);
        }
    }
    for layout in DATE_LAYOUTS {
        if let Some(midnight) = NaiveDate::parse_from_str(value, layout)
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
        {
            return Ok(midnight);
        }
    }
    Err(ConversionError::new(value, "timestamp"))
}

pub fn parse_integer(value: &str) -> Result<i64, ConversionError> {
    value
        .parse()
        .map_err(|_| ConversionError::new(value, "integer"))
}

/// Parses the literals the analyzer accepts as decimal, including `.5` and `3.`.
/// Literals that would lose digits (more than 28 significant digits or a
/// scale above 28) are rejected, never rounded.
pub fn parse_decimal(value: &str) -> Result<Decimal, ConversionError> {
    let digits = decimal_digits(value).ok_or_else(|| ConversionError::new(value, "decimal"))?;
    let negative = value.starts_with('-');
    let body = value.trim_start_matches(['+', '-']);
    let (integer, fraction) = body.split_once('.').unwrap_or((body, ""));
    let mut canonical = String::with_capacity(body.len() + 2);
    if negative {
        canonical.push('-');
    }
    canonical.push_str(if digits.integer == 0 { "0" } else { integer });
    if digits.fraction > 0 {
        canonical.push('.');
        canonical.push_str(fraction);
    }
    Decimal::from_str_exact(&canonical).map_err(|_| ConversionError::new(value, "decimal"))
}

/// Converts one cell, reporting why it could not be converted.
pub fn try_convert(text: &str, profile: &ColumnProfile) -> Result<TypedValue, ConversionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(TypedValue::Null);
    }
    let value = match profile {
        ColumnProfile::Text { .. } => TypedValue::Text(trimmed.to_string()),
        ColumnProfile::Integer => TypedValue::Integer(parse_integer(trimmed)?),
        ColumnProfile::Decimal { .. } => TypedValue::Decimal(parse_decimal(trimmed)?),
        ColumnProfile::Timestamp => TypedValue::Timestamp(parse_timestamp(trimmed)?),
        ColumnProfile::Boolean => TypedValue::Boolean(parse_boolean(trimmed)?),
        ColumnProfile::UniqueIdentifier => {
            TypedValue::UniqueIdentifier(parse_unique_identifier(trimmed)?)
        }
    };
    Ok(value)
}

/// Converts one cell; values that do not fit the profile become null.
pub fn convert(text: &str, profile: &ColumnProfile) -> TypedValue {
    try_convert(text, profile).unwrap_or_else(|err| {
        log::debug!("{err}; storing NULL");
        TypedValue::Null
    })
}

/// A raw record converted column by column, plus the load timestamp shared
/// by every record of one load. Values follow the sanitized column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedRecord {
    line: u64,
    values: Vec<TypedValue>,
    loaded_at: NaiveDateTime,
}

impl TypedRecord {
    pub fn new(line: u64, values: Vec<TypedValue>, loaded_at: NaiveDateTime) -> Self {
        Self {
            line,
            values,
            loaded_at,
        }
    }

    /// Converts the mapped columns of `raw`; reserved columns are skipped.
    pub fn from_raw(
        raw: &RawRecord,
        profiles: &[ColumnMeta],
        map: &SanitizedColumnMap,
        loaded_at: NaiveDateTime,
    ) -> Self {
        let values = map
            .columns()
            .iter()
            .map(|mapping| {
                let text = raw.value(mapping.source_index).unwrap_or_default();
                convert(text, &profiles[mapping.source_index].profile)
            })
            .collect();
        Self::new(raw.line(), values, loaded_at)
    }

    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }

    pub fn loaded_at(&self) -> NaiveDateTime {
        self.loaded_at
    }
}
