//! Transactional batch loading with retry and duplicate-key idempotency.
//!
//! Records are cut into fixed-size batches in input order and written one
//! batch at a time. Each batch moves through
//!
//! ```text
//! Building -> Writing -> Committed
//!                     -> rolled back, duplicate key  => counted as applied
//!                     -> rolled back, other error    => retry or fatal
//! ```
//!
//! Batch `k + 1` is not started until batch `k` reaches a terminal state. A
//! fatal batch stops the load; batches committed before it stay committed.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::debug;
use serde::Serialize;

use crate::{
    convert::TypedRecord,
    retry::RetryPolicy,
    sink::{Sink, SinkConnection, SinkError, TableLayout},
};

/// Cooperative cancellation, checked before each batch starts.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one load. Progress counters are reported on failure too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub success: bool,
    /// Records in committed or already-applied batches.
    pub records_processed: usize,
    pub batches_processed: usize,
    /// Batches rolled back on a duplicate key and counted as already applied.
    pub batches_skipped: usize,
    /// Rows newly inserted by this load.
    pub rows_written: usize,
    pub error: Option<String>,
}

impl LoadResult {
    pub fn empty() -> Self {
        LoadProgress::default().finish(None)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        LoadProgress::default().finish(Some(error.into()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LoadProgress {
    records_processed: usize,
    batches_processed: usize,
    batches_skipped: usize,
    rows_written: usize,
}

impl LoadProgress {
    fn finish(self, error: Option<String>) -> LoadResult {
        LoadResult {
            success: error.is_none(),
            records_processed: self.records_processed,
            batches_processed: self.batches_processed,
            batches_skipped: self.batches_skipped,
            rows_written: self.rows_written,
            error,
        }
    }
}

/// Position of a batch within a load; `number` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchInfo {
    pub number: usize,
    pub total: usize,
    pub rows: usize,
    pub first_line: u64,
    pub last_line: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    Committed {
        batch: BatchInfo,
        rows_written: usize,
        attempts: u32,
    },
    AlreadyApplied {
        batch: BatchInfo,
        error: SinkError,
    },
    Retrying {
        batch: BatchInfo,
        attempt: u32,
        delay: Duration,
        error: SinkError,
    },
    Failed {
        batch: BatchInfo,
        attempts: u32,
        error: SinkError,
    },
    Cancelled {
        next_batch: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOutcome {
    Committed { rows_written: usize, attempts: u32 },
    AlreadyApplied(SinkError),
    Fatal { attempts: u32, error: SinkError },
}

pub struct BatchLoader<'a, S: Sink> {
    sink: &'a S,
    layout: &'a TableLayout,
    retry: RetryPolicy,
}

impl<'a, S: Sink> BatchLoader<'a, S> {
    pub fn new(sink: &'a S, layout: &'a TableLayout, retry: RetryPolicy) -> Self {
        Self {
            sink,
            layout,
            retry,
        }
    }

    /// Number of batches `records` splits into at `batch_size`.
    pub fn batch_count(records: usize, batch_size: usize) -> usize {
        records.div_ceil(batch_size.max(1))
    }

    pub fn load(
        &self,
        records: &[TypedRecord],
        batch_size: usize,
        cancel: &CancellationFlag,
        on_event: &mut dyn FnMut(LoadEvent),
    ) -> LoadResult {
        let batch_size = batch_size.max(1);
        let total = Self::batch_count(records.len(), batch_size);
        let mut progress = LoadProgress::default();

        for (index, batch) in records.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                on_event(LoadEvent::Cancelled {
                    next_batch: index + 1,
                    total,
                });
                return progress.finish(Some(format!(
                    "Load cancelled before batch {}/{total}",
                    index + 1
                )));
            }
            let info = BatchInfo {
                number: index + 1,
                total,
                rows: batch.len(),
                first_line: batch.first().map(TypedRecord::line).unwrap_or_default(),
                last_line: batch.last().map(TypedRecord::line).unwrap_or_default(),
            };
            match self.write_with_retry(batch, info, on_event) {
                BatchOutcome::Committed {
                    rows_written,
                    attempts,
                } => {
                    progress.records_processed += batch.len();
                    progress.batches_processed += 1;
                    progress.rows_written += rows_written;
                    on_event(LoadEvent::Committed {
                        batch: info,
                        rows_written,
                        attempts,
                    });
                }
                BatchOutcome::AlreadyApplied(error) => {
                    progress.records_processed += batch.len();
                    progress.batches_processed += 1;
                    progress.batches_skipped += 1;
                    on_event(LoadEvent::AlreadyApplied { batch: info, error });
                }
                BatchOutcome::Fatal { attempts, error } => {
                    let summary = format!(
                        "Batch {}/{} (lines {}-{}) failed after {attempts} attempt(s): {error}",
                        info.number, info.total, info.first_line, info.last_line
                    );
                    on_event(LoadEvent::Failed {
                        batch: info,
                        attempts,
                        error,
                    });
                    return progress.finish(Some(summary));
                }
            }
        }
        progress.finish(None)
    }

    fn write_with_retry(
        &self,
        batch: &[TypedRecord],
        info: BatchInfo,
        on_event: &mut dyn FnMut(LoadEvent),
    ) -> BatchOutcome {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            debug!(
                "Writing batch {}/{} ({} rows), attempt {attempt}",
                info.number, info.total, info.rows
            );
            match self.write_once(batch) {
                Ok(rows_written) => {
                    return BatchOutcome::Committed {
                        rows_written,
                        attempts: attempt,
                    };
                }
                Err(error) if error.is_duplicate_key() => {
                    return BatchOutcome::AlreadyApplied(error);
                }
                Err(error) if attempt >= max_attempts => {
                    return BatchOutcome::Fatal {
                        attempts: attempt,
                        error,
                    };
                }
                Err(error) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    on_event(LoadEvent::Retrying {
                        batch: info,
                        attempt,
                        delay,
                        error,
                    });
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt on a fresh connection, released when this returns.
    fn write_once(&self, batch: &[TypedRecord]) -> Result<usize, SinkError> {
        let mut connection = self.sink.connect()?;
        connection.write_batch(self.layout, batch)
    }
}
