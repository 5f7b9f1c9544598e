#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use csv_loader::{
    config::LoadConfig,
    events::MemoryLogger,
    loader::{CancellationFlag, LoadResult},
    pipeline::{Pipeline, PreparedLoad},
    sink::render_create_table,
    sqlite::SqliteSink,
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents).expect("write temp file contents");
        path
    }

    /// SQLite sink on a database file inside the workspace.
    pub fn sqlite(&self, name: &str) -> SqliteSink {
        SqliteSink::new(self.path().join(name), Duration::from_secs(5), 5000)
    }
}

/// Config with retries that never sleep.
pub fn fast_config() -> LoadConfig {
    LoadConfig {
        retry_delay_ms: 0,
        ..LoadConfig::default()
    }
}

/// Creates `table` shaped for `content`, as the administrative step would.
pub fn create_table_for(
    sink: &SqliteSink,
    config: &LoadConfig,
    table: &str,
    content: &str,
    unique: &[&str],
) {
    let prepared = PreparedLoad::from_bytes(content.as_bytes(), config).expect("prepare");
    let unique = unique.iter().map(|name| name.to_string()).collect::<Vec<_>>();
    let sql = render_create_table(
        table,
        &prepared.profiles,
        &prepared.columns,
        &config.load_timestamp_column,
        &unique,
    )
    .expect("render ddl");
    sink.execute_script(&sql).expect("create table");
}

pub fn load(
    sink: &SqliteSink,
    config: &LoadConfig,
    logger: &MemoryLogger,
    table: &str,
    content: &str,
) -> LoadResult {
    Pipeline::new(config, sink).with_logger(logger).run(
        "input.csv",
        content.as_bytes(),
        table,
        &CancellationFlag::new(),
    )
}
