//! Load configuration.
//!
//! A [`LoadConfig`] is passed explicitly to every stage that needs it; nothing
//! is cached globally, so loads with different separators can run side by
//! side. Values come from an optional YAML file and are then overridden by
//! command-line flags.

use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{io_utils, retry::RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadConfig {
    pub delimiter: char,
    pub quote: char,
    /// `encoding_rs` label of the input; utf-8 when absent.
    pub encoding: Option<String>,
    /// Records per transactional batch.
    pub batch_size: usize,
    /// Rows per bulk-insert statement inside a batch.
    pub bulk_batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub bulk_timeout_secs: u64,
    pub load_timestamp_column: String,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            delimiter: io_utils::DEFAULT_CSV_DELIMITER as char,
            quote: io_utils::DEFAULT_QUOTE as char,
            encoding: None,
            batch_size: 100,
            bulk_batch_size: 5000,
            max_retries: 3,
            retry_delay_ms: 500,
            bulk_timeout_secs: 30,
            load_timestamp_column: "loaded_at".to_string(),
        }
    }
}

impl LoadConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_delimiter(path, io_utils::DEFAULT_CSV_DELIMITER as char)
    }

    /// Like [`LoadConfig::load`], with `fallback_delimiter` used when the file
    /// has no `delimiter` key.
    pub fn load_with_delimiter(path: &Path, fallback_delimiter: char) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening config file {path:?}"))?;
        let reader = BufReader::new(file);
        let document: serde_yaml::Value =
            serde_yaml::from_reader(reader).context("Parsing load config YAML")?;
        let sets_delimiter = document.get("delimiter").is_some();
        let mut config: LoadConfig = if document.is_null() {
            LoadConfig::default()
        } else {
            serde_yaml::from_value(document).context("Parsing load config YAML")?
        };
        if !sets_delimiter {
            config.delimiter = fallback_delimiter;
        }
        config
            .validate()
            .with_context(|| format!("Validating config file {path:?}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(self.bulk_batch_size > 0, "bulk_batch_size must be positive");
        ensure!(
            self.delimiter.is_ascii() && self.quote.is_ascii(),
            "delimiter and quote must be ASCII characters"
        );
        ensure!(
            self.delimiter != self.quote,
            "delimiter and quote must differ"
        );
        ensure!(
            !matches!(self.delimiter, '\r' | '\n') && !matches!(self.quote, '\r' | '\n'),
            "delimiter and quote cannot be line breaks"
        );
        ensure!(
            !self.load_timestamp_column.trim().is_empty(),
            "load_timestamp_column cannot be empty"
        );
        Ok(())
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    pub fn quote_byte(&self) -> u8 {
        self.quote as u8
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}
