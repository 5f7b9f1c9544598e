//! Column profiles and the type inference engine.
//!
//! A [`ColumnProfile`] is the relational type inferred for one column from
//! every non-empty value it holds. Inference walks a fixed precedence list,
//! narrowest first, and the first type that accepts *every* value wins:
//!
//! 1. unique identifier (canonical hyphenated UUID)
//! 2. boolean token
//! 3. timestamp in one of the accepted layouts
//! 4. 64-bit integer
//! 5. decimal literal
//! 6. text, bounded by the smallest length bucket that fits
//!
//! Every predicate is a universal check and every size bound is a maximum, so
//! the result does not depend on row order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::convert;

/// Text length buckets, smallest first.
pub const TEXT_LENGTH_BUCKETS: &[u32] = &[50, 100, 255, 500, 1000, 4000];
pub const DEFAULT_TEXT_LENGTH: u32 = 255;
pub const DECIMAL_MIN_PRECISION: u32 = 18;
pub const DECIMAL_MIN_SCALE: u32 = 2;
pub const DECIMAL_MAX_PRECISION: u32 = 38;

/// Serialized as the bound itself, or `null` when unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextLength {
    Bounded(u32),
    Unbounded,
}

impl TextLength {
    /// Smallest bucket that holds `max_chars`, or unbounded past the last one.
    pub fn for_max_chars(max_chars: usize) -> Self {
        TEXT_LENGTH_BUCKETS
            .iter()
            .copied()
            .find(|&bucket| bucket as usize >= max_chars)
            .map(TextLength::Bounded)
            .unwrap_or(TextLength::Unbounded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnProfile {
    Text { length: TextLength },
    Integer,
    Decimal { precision: u32, scale: u32 },
    Timestamp,
    Boolean,
    UniqueIdentifier,
}

impl Default for ColumnProfile {
    fn default() -> Self {
        ColumnProfile::Text {
            length: TextLength::Bounded(DEFAULT_TEXT_LENGTH),
        }
    }
}

impl ColumnProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnProfile::Text { .. } => "text",
            ColumnProfile::Integer => "integer",
            ColumnProfile::Decimal { .. } => "decimal",
            ColumnProfile::Timestamp => "timestamp",
            ColumnProfile::Boolean => "boolean",
            ColumnProfile::UniqueIdentifier => "unique_identifier",
        }
    }

    /// Column type as written in a `CREATE TABLE` statement.
    pub fn sql_type(&self) -> String {
        match self {
            ColumnProfile::Text {
                length: TextLength::Bounded(length),
            } => format!("VARCHAR({length})"),
            ColumnProfile::Text {
                length: TextLength::Unbounded,
            } => "TEXT".to_string(),
            ColumnProfile::Integer => "BIGINT".to_string(),
            ColumnProfile::Decimal { precision, scale } => {
                format!("DECIMAL({precision},{scale})")
            }
            ColumnProfile::Timestamp => "DATETIME".to_string(),
            ColumnProfile::Boolean => "BOOLEAN".to_string(),
            ColumnProfile::UniqueIdentifier => "CHAR(36)".to_string(),
        }
    }
}

impl fmt::Display for ColumnProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnProfile::Text {
                length: TextLength::Bounded(length),
            } => write!(f, "text({length})"),
            ColumnProfile::Text {
                length: TextLength::Unbounded,
            } => write!(f, "text(unbounded)"),
            ColumnProfile::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// A named profile, in header order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(flatten)]
    pub profile: ColumnProfile,
}

/// Digit counts of one decimal literal, sign excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecimalDigits {
    pub integer: u32,
    pub fraction: u32,
}

/// Splits an optionally signed base-10 literal into digit counts, or `None`
/// when the text is not one. Exponents are not accepted.
pub(crate) fn decimal_digits(value: &str) -> Option<DecimalDigits> {
    let body = value.strip_prefix(['+', '-']).unwrap_or(value);
    let (integer, fraction) = body.split_once('.').unwrap_or((body, ""));
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    if !all_digits(integer) || !all_digits(fraction) {
        return None;
    }
    Some(DecimalDigits {
        integer: integer.len() as u32,
        fraction: fraction.len() as u32,
    })
}

/// Running facts about a column; each field only ever narrows or grows, so
/// folding values in any order reaches the same state.
#[derive(Debug, Clone)]
struct TypeCandidate {
    non_empty: usize,
    all_uuid: bool,
    all_boolean: bool,
    all_timestamp: bool,
    all_integer: bool,
    all_decimal: bool,
    decimal_max_digits: u32,
    decimal_max_scale: u32,
    max_chars: usize,
}

impl TypeCandidate {
    fn new() -> Self {
        Self {
            non_empty: 0,
            all_uuid: true,
            all_boolean: true,
            all_timestamp: true,
            all_integer: true,
            all_decimal: true,
            decimal_max_digits: 0,
            decimal_max_scale: 0,
            max_chars: 0,
        }
    }

    fn update(&mut self, value: &str) {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        self.non_empty += 1;
        self.max_chars = self.max_chars.max(trimmed.chars().count());

        if self.all_uuid {
            self.all_uuid = convert::parse_unique_identifier(trimmed).is_ok();
        }
        if self.all_boolean {
            self.all_boolean = convert::parse_boolean(trimmed).is_ok();
        }
        if self.all_timestamp {
            self.all_timestamp = convert::parse_timestamp(trimmed).is_ok();
        }
        if self.all_integer {
            self.all_integer = trimmed.parse::<i64>().is_ok();
        }
        if self.all_decimal {
            match decimal_digits(trimmed).filter(|_| convert::parse_decimal(trimmed).is_ok()) {
                Some(digits) => {
                    self.decimal_max_digits = self
                        .decimal_max_digits
                        .max(digits.integer + digits.fraction);
                    self.decimal_max_scale = self.decimal_max_scale.max(digits.fraction);
                }
                None => self.all_decimal = false,
            }
        }
    }

    fn decimal_profile(&self) -> ColumnProfile {
        let precision = self
            .decimal_max_digits
            .max(DECIMAL_MIN_PRECISION)
            .min(DECIMAL_MAX_PRECISION);
        let scale = self.decimal_max_scale.max(DECIMAL_MIN_SCALE).min(precision);
        ColumnProfile::Decimal { precision, scale }
    }

    fn decide(&self) -> ColumnProfile {
        if self.non_empty == 0 {
            return ColumnProfile::default();
        }
        if self.all_uuid {
            ColumnProfile::UniqueIdentifier
        } else if self.all_boolean {
            ColumnProfile::Boolean
        } else if self.all_timestamp {
            ColumnProfile::Timestamp
        } else if self.all_integer {
            ColumnProfile::Integer
        } else if self.all_decimal {
            self.decimal_profile()
        } else {
            ColumnProfile::Text {
                length: TextLength::for_max_chars(self.max_chars),
            }
        }
    }
}

/// Infers the profile of one column from all of its values. Empty and
/// whitespace-only values are ignored.
pub fn analyze<'a, I>(column_name: &str, values: I) -> ColumnProfile
where
    I: IntoIterator<Item = &'a str>,
{
    let mut candidate = TypeCandidate::new();
    for value in values {
        candidate.update(value);
    }
    let profile = candidate.decide();
    log::debug!(
        "Column '{column_name}' inferred as {profile} from {} non-empty value(s)",
        candidate.non_empty
    );
    profile
}

/// Profiles every header column of a parsed table, in header order.
pub fn analyze_table(table: &crate::parser::ParsedTable) -> Vec<ColumnMeta> {
    table
        .headers
        .iter()
        .enumerate()
        .map(|(idx, name)| ColumnMeta {
            name: name.clone(),
            profile: analyze(name, table.column_values(idx)),
        })
        .collect()
}
