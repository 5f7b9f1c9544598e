//! Delimited-text parsing into a header plus raw records.
//!
//! Parsing is a single left-to-right pass over the decoded text. A quote
//! character toggles the in-quote state wherever it appears in a cell, and a
//! doubled quote inside quotes stands for one literal quote. Separators and
//! line breaks only split cells and records outside quotes. Blank lines are
//! discarded, the first remaining line is the header, and every data row must
//! carry exactly as many cells as the header. Ragged rows are collected rather
//! than reported one at a time, so a bad file is diagnosed in one pass.

use std::{collections::HashSet, fmt, iter::Peekable, str::Chars};

use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMismatch {
    pub line: u64,
    pub actual: usize,
}

impl fmt::Display for LineMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} has {} cell(s)", self.line, self.actual)
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Header line contains no column names")]
    EmptyHeader,
    #[error("Duplicate column name '{name}' in header")]
    DuplicateHeader { name: String },
    #[error(
        "{} row(s) do not match the header's {expected} column(s): {}",
        .mismatches.len(),
        .mismatches.iter().join("; ")
    )]
    ColumnCountMismatch {
        expected: usize,
        mismatches: Vec<LineMismatch>,
    },
    #[error("Quoted cell opened on line {line} is never closed")]
    UnterminatedQuote { line: u64 },
}

/// One data row. Values are stored positionally, aligned with
/// [`ParsedTable::headers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    line: u64,
    values: Vec<String>,
}

impl RawRecord {
    pub fn new(line: u64, values: Vec<String>) -> Self {
        Self { line, values }
    }

    /// 1-based physical line on which the row starts.
    pub fn line(&self) -> u64 {
        self.line
    }

    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Pairs each header name with this row's value, in header order.
    pub fn fields<'a>(
        &'a self,
        headers: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        headers
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub records: Vec<RawRecord>,
}

impl ParsedTable {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// All raw values of one column, in row order.
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &str> + '_ {
        self.records
            .iter()
            .filter_map(move |record| record.value(index))
    }
}

pub fn parse(text: &str, separator: u8, quote: u8) -> Result<ParsedTable, ParseError> {
    let mut scanner = Scanner::new(text, separator as char, quote as char);
    let mut headers: Option<Vec<String>> = None;
    let mut records = Vec::new();
    let mut mismatches = Vec::new();

    while let Some(row) = scanner.next_row()? {
        if row.is_blank() {
            continue;
        }
        let Some(expected) = headers.as_ref().map(Vec::len) else {
            headers = Some(parse_header(row.cells)?);
            continue;
        };
        if row.cells.len() != expected {
            mismatches.push(LineMismatch {
                line: row.line,
                actual: row.cells.len(),
            });
            continue;
        }
        records.push(RawRecord::new(row.line, row.cells));
    }

    let headers = headers.unwrap_or_default();
    if !mismatches.is_empty() {
        return Err(ParseError::ColumnCountMismatch {
            expected: headers.len(),
            mismatches,
        });
    }
    Ok(ParsedTable { headers, records })
}

/// One physical record as scanned, before header or width checks.
#[derive(Debug)]
struct ScannedRow {
    line: u64,
    cells: Vec<String>,
    quoted: bool,
}

impl ScannedRow {
    fn is_blank(&self) -> bool {
        !self.quoted
            && self.cells.len() <= 1
            && self.cells.iter().all(|cell| cell.trim().is_empty())
    }
}

struct Scanner<'a> {
    chars: Peekable<Chars<'a>>,
    separator: char,
    quote: char,
    line: u64,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str, separator: char, quote: char) -> Self {
        Self {
            chars: text.chars().peekable(),
            separator,
            quote,
            line: 1,
        }
    }

    /// Reads the next record, or `None` at end of input. `\n`, `\r\n` and a
    /// lone `\r` all end a record outside quotes.
    fn next_row(&mut self) -> Result<Option<ScannedRow>, ParseError> {
        if self.chars.peek().is_none() {
            return Ok(None);
        }
        let line = self.line;
        let mut cells = Vec::new();
        let mut cell = String::new();
        let mut in_quote = false;
        let mut quoted = false;

        while let Some(c) = self.chars.next() {
            if c == self.quote {
                if in_quote && self.chars.peek() == Some(&self.quote) {
                    self.chars.next();
                    cell.push(self.quote);
                } else {
                    in_quote = !in_quote;
                    quoted = true;
                }
            } else if in_quote {
                if c == '\n' {
                    self.line += 1;
                }
                cell.push(c);
            } else if c == self.separator {
                cells.push(std::mem::take(&mut cell));
            } else if c == '\n' || c == '\r' {
                if c == '\r' && self.chars.peek() == Some(&'\n') {
                    self.chars.next();
                }
                self.line += 1;
                cells.push(cell);
                return Ok(Some(ScannedRow {
                    line,
                    cells,
                    quoted,
                }));
            } else {
                cell.push(c);
            }
        }

        if in_quote {
            return Err(ParseError::UnterminatedQuote { line });
        }
        cells.push(cell);
        Ok(Some(ScannedRow {
            line,
            cells,
            quoted,
        }))
    }
}

fn parse_header(cells: Vec<String>) -> Result<Vec<String>, ParseError> {
    let headers = cells
        .into_iter()
        .map(|cell| cell.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();
    if headers.is_empty() {
        return Err(ParseError::EmptyHeader);
    }
    let mut seen = HashSet::with_capacity(headers.len());
    for name in &headers {
        if !seen.insert(name.as_str()) {
            return Err(ParseError::DuplicateHeader { name: name.clone() });
        }
    }
    Ok(headers)
}
