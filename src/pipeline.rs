//! Orchestration of one file load: decode, parse, profile, sanitize, convert,
//! and batch-load, with progress reported to the event logger.
//!
//! Structural problems (undecodable input, ragged rows, empty header,
//! identifier collisions) fail the load before the sink is touched. Whatever
//! happens, the caller gets a [`LoadResult`].

use chrono::Utc;
use log::info;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    config::LoadConfig,
    convert::TypedRecord,
    events::{self, EventLevel, EventLogger},
    identifier::{IdentifierError, SanitizedColumnMap},
    io_utils,
    loader::{BatchLoader, CancellationFlag, LoadEvent, LoadResult},
    parser::{self, ParseError, ParsedTable},
    profile::{self, ColumnMeta},
    sink::{Sink, TableLayout},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Decode(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Everything derived from the input before any row is written.
#[derive(Debug, Clone)]
pub struct PreparedLoad {
    pub table: ParsedTable,
    pub profiles: Vec<ColumnMeta>,
    pub columns: SanitizedColumnMap,
    pub digest: String,
}

impl PreparedLoad {
    pub fn from_bytes(content: &[u8], config: &LoadConfig) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|err| PipelineError::Config(format!("{err:#}")))?;
        let encoding = io_utils::resolve_encoding(config.encoding.as_deref())
            .map_err(|err| PipelineError::Config(format!("{err:#}")))?;
        let text = io_utils::decode_bytes(content, encoding)
            .map_err(|err| PipelineError::Decode(format!("{err:#}")))?;
        let table = parser::parse(&text, config.delimiter_byte(), config.quote_byte())?;
        let profiles = profile::analyze_table(&table);
        let columns =
            SanitizedColumnMap::build(&profiles, &[config.load_timestamp_column.as_str()])?;
        Ok(Self {
            table,
            profiles,
            columns,
            digest: format!("{:x}", Sha256::digest(content)),
        })
    }

    pub fn layout(&self, table: &str, config: &LoadConfig) -> TableLayout {
        TableLayout::new(
            table,
            &self.profiles,
            &self.columns,
            &config.load_timestamp_column,
        )
    }
}

pub struct Pipeline<'a, S: Sink> {
    config: &'a LoadConfig,
    sink: &'a S,
    logger: Option<&'a dyn EventLogger>,
}

impl<'a, S: Sink> Pipeline<'a, S> {
    pub fn new(config: &'a LoadConfig, sink: &'a S) -> Self {
        Self {
            config,
            sink,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: &'a dyn EventLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Loads one file's content into `table`.
    pub fn run(
        &self,
        file_name: &str,
        content: &[u8],
        table: &str,
        cancel: &CancellationFlag,
    ) -> LoadResult {
        match PreparedLoad::from_bytes(content, self.config) {
            Ok(prepared) => self.run_prepared(file_name, &prepared, table, cancel),
            Err(err) => self.reject(file_name, &err),
        }
    }

    /// Reports a structural failure found while preparing `file_name`.
    pub fn reject(&self, file_name: &str, err: &PipelineError) -> LoadResult {
        self.emit(
            EventLevel::Error,
            "Load rejected before writing",
            Some(json!({ "file": file_name, "error": err.to_string() })),
        );
        LoadResult::failed(format!("{file_name}: {err}"))
    }

    /// Loads an input that has already been decoded, parsed and profiled.
    pub fn run_prepared(
        &self,
        file_name: &str,
        prepared: &PreparedLoad,
        table: &str,
        cancel: &CancellationFlag,
    ) -> LoadResult {
        info!("Loading '{file_name}' into table '{table}'");
        self.report_prepared(file_name, prepared);

        if prepared.table.is_empty() {
            self.emit(
                EventLevel::Info,
                "No data rows; nothing to load",
                Some(json!({ "file": file_name })),
            );
            return LoadResult::empty();
        }

        let loaded_at = Utc::now().naive_utc();
        let records = prepared
            .table
            .records
            .iter()
            .map(|raw| TypedRecord::from_raw(raw, &prepared.profiles, &prepared.columns, loaded_at))
            .collect::<Vec<_>>();

        let layout = prepared.layout(table, self.config);
        let loader = BatchLoader::new(self.sink, &layout, self.config.retry_policy());
        let result = loader.load(
            &records,
            self.config.batch_size,
            cancel,
            &mut |event| self.report_batch(&event),
        );

        let details = json!({
            "file": file_name,
            "table": table,
            "result": result,
        });
        if result.success {
            self.emit(EventLevel::Info, "Load complete", Some(details));
        } else {
            self.emit(EventLevel::Error, "Load failed", Some(details));
        }
        result
    }

    fn report_prepared(&self, file_name: &str, prepared: &PreparedLoad) {
        self.emit(
            EventLevel::Info,
            "Parse complete",
            Some(json!({
                "file": file_name,
                "records": prepared.table.records.len(),
                "columns": prepared.table.headers.len(),
                "sha256": prepared.digest,
            })),
        );
        let profiles = prepared
            .profiles
            .iter()
            .map(|column| (column.name.clone(), Value::String(column.profile.to_string())))
            .collect::<serde_json::Map<_, _>>();
        self.emit(
            EventLevel::Info,
            "Column profiles computed",
            Some(json!({
                "profiles": profiles,
                "reserved_dropped": prepared.columns.dropped(),
            })),
        );
    }

    fn report_batch(&self, event: &LoadEvent) {
        match event {
            LoadEvent::Committed {
                batch,
                rows_written,
                attempts,
            } => self.emit(
                EventLevel::Info,
                &format!("Batch {}/{} committed", batch.number, batch.total),
                Some(json!({ "batch": batch, "rows_written": rows_written, "attempts": attempts })),
            ),
            LoadEvent::AlreadyApplied { batch, error } => self.emit(
                EventLevel::Warning,
                &format!(
                    "Batch {}/{} hit a duplicate key; rolled back and treated as already applied",
                    batch.number, batch.total
                ),
                Some(json!({ "batch": batch, "error": error.to_string() })),
            ),
            LoadEvent::Retrying {
                batch,
                attempt,
                delay,
                error,
            } => self.emit(
                EventLevel::Warning,
                &format!(
                    "Batch {}/{} rolled back on attempt {attempt}; retrying in {} ms",
                    batch.number,
                    batch.total,
                    delay.as_millis()
                ),
                Some(json!({ "batch": batch, "error": error.to_string() })),
            ),
            LoadEvent::Failed {
                batch,
                attempts,
                error,
            } => self.emit(
                EventLevel::Error,
                &format!(
                    "Batch {}/{} failed after {attempts} attempt(s); aborting load",
                    batch.number, batch.total
                ),
                Some(json!({ "batch": batch, "error": error.to_string() })),
            ),
            LoadEvent::Cancelled { next_batch, total } => self.emit(
                EventLevel::Warning,
                &format!("Load cancelled before batch {next_batch}/{total}"),
                None,
            ),
        }
    }

    fn emit(&self, level: EventLevel, message: &str, details: Option<Value>) {
        events::emit(self.logger, level, message, details.as_ref());
    }
}
