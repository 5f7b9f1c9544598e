//! Structured load events and the logging collaborator.
//!
//! The pipeline reports progress through an [`EventLogger`]. Logger failures
//! are never fatal: [`emit`] falls back to the `log` facade so the event is
//! still recorded locally.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::debug;
use serde::Serialize;
use serde_json::{Value, json};

pub const EVENT_TARGET: &str = "csv_loader::events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl From<EventLevel> for log::Level {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Info => log::Level::Info,
            EventLevel::Warning => log::Level::Warn,
            EventLevel::Error => log::Level::Error,
        }
    }
}

pub trait EventLogger {
    fn log(&self, level: EventLevel, message: &str, details: Option<&Value>) -> Result<()>;
}

/// Sends an event to `logger`, or to the `log` facade when there is no
/// logger or it fails.
pub fn emit(
    logger: Option<&dyn EventLogger>,
    level: EventLevel,
    message: &str,
    details: Option<&Value>,
) {
    if let Some(logger) = logger {
        match logger.log(level, message, details) {
            Ok(()) => return,
            Err(err) => debug!("Event logger failed, using local log: {err:#}"),
        }
    }
    log_locally(level, message, details);
}

fn log_locally(level: EventLevel, message: &str, details: Option<&Value>) {
    let level = log::Level::from(level);
    match details {
        Some(details) => log::log!(target: EVENT_TARGET, level, "{message} {details}"),
        None => log::log!(target: EVENT_TARGET, level, "{message}"),
    }
}

/// Forwards events into the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeLogger;

impl EventLogger for FacadeLogger {
    fn log(&self, level: EventLevel, message: &str, details: Option<&Value>) -> Result<()> {
        log_locally(level, message, details);
        Ok(())
    }
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonLinesLogger {
    file: Mutex<File>,
}

impl JsonLinesLogger {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Opening event log {path:?}"))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventLogger for JsonLinesLogger {
    fn log(&self, level: EventLevel, message: &str, details: Option<&Value>) -> Result<()> {
        let line = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "message": message,
            "details": details,
        });
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("Event log lock poisoned"))?;
        serde_json::to_writer(&mut *file, &line).context("Writing event")?;
        file.write_all(b"\n").context("Writing event")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedEvent {
    pub level: EventLevel,
    pub message: String,
    pub details: Option<Value>,
}

/// Keeps events in memory, for embedding callers that inspect them afterwards.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, level: EventLevel) -> usize {
        self.events()
            .iter()
            .filter(|event| event.level == level)
            .count()
    }
}

impl EventLogger for MemoryLogger {
    fn log(&self, level: EventLevel, message: &str, details: Option<&Value>) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("Event buffer lock poisoned"))?
            .push(RecordedEvent {
                level,
                message: message.to_string(),
                details: details.cloned(),
            });
        Ok(())
    }
}
