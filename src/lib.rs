pub mod cli;
pub mod config;
pub mod convert;
pub mod events;
pub mod identifier;
pub mod io_utils;
pub mod loader;
pub mod parser;
pub mod pipeline;
pub mod profile;
pub mod retry;
pub mod sink;
pub mod sqlite;

use std::{env, fs, io::Write, path::Path, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, Commands, InputArgs},
    config::LoadConfig,
    events::{EventLogger, FacadeLogger, JsonLinesLogger},
    loader::CancellationFlag,
    pipeline::{Pipeline, PreparedLoad},
    sink::render_create_table,
    sqlite::SqliteSink,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_loader", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Probe(args) => handle_probe(&args),
        Commands::Ddl(args) => handle_ddl(&args),
        Commands::Load(args) => handle_load(&args),
    }
}

/// Config file values first, then command-line overrides. When neither sets
/// the delimiter, it follows the file extension.
fn resolve_config(args: &InputArgs) -> Result<LoadConfig> {
    let by_extension = io_utils::resolve_input_delimiter(&args.input, None) as char;
    let mut config = match &args.config {
        Some(path) => LoadConfig::load_with_delimiter(path, by_extension)?,
        None => LoadConfig {
            delimiter: by_extension,
            ..LoadConfig::default()
        },
    };
    if let Some(delimiter) = args.delimiter {
        config.delimiter = delimiter as char;
    }
    if let Some(quote) = args.quote {
        config.quote = quote as char;
    }
    if let Some(encoding) = &args.input_encoding {
        config.encoding = Some(encoding.clone());
    }
    Ok(config)
}

fn read(args: &InputArgs, config: &LoadConfig) -> Result<Vec<u8>> {
    info!(
        "Reading '{}' with delimiter '{}'",
        args.input.display(),
        io_utils::printable_delimiter(config.delimiter_byte())
    );
    io_utils::read_input(&args.input)
}

fn prepare(args: &InputArgs, config: &LoadConfig) -> Result<PreparedLoad> {
    let content = read(args, config)?;
    PreparedLoad::from_bytes(&content, config)
        .with_context(|| format!("Analyzing {:?}", args.input))
}

fn table_name(requested: Option<&str>, input: &Path) -> Result<String> {
    let table = match requested {
        Some(name) => name.to_string(),
        None => identifier::table_name_for(
            &input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )?,
    };
    identifier::validate_table_name(&table)?;
    Ok(table)
}

fn handle_probe(args: &cli::ProbeArgs) -> Result<()> {
    let config = resolve_config(&args.input)?;
    let prepared = prepare(&args.input, &config)?;
    let yaml = serde_yaml::to_string(&prepared.profiles).context("Serializing profiles")?;
    match &args.output {
        Some(path) => {
            fs::write(path, yaml).with_context(|| format!("Writing profiles to {path:?}"))?;
            info!(
                "Profiles for {} column(s) written to {path:?}",
                prepared.profiles.len()
            );
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

fn handle_ddl(args: &cli::DdlArgs) -> Result<()> {
    let config = resolve_config(&args.input)?;
    let table = table_name(args.table.as_deref(), &args.input.input)?;
    let prepared = prepare(&args.input, &config)?;
    let sql = render_create_table(
        &table,
        &prepared.profiles,
        &prepared.columns,
        &config.load_timestamp_column,
        &args.unique,
    )?;
    print!("{sql}");
    Ok(())
}

fn handle_load(args: &cli::LoadArgs) -> Result<()> {
    let mut config = resolve_config(&args.input)?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(retry_delay_ms) = args.retry_delay_ms {
        config.retry_delay_ms = retry_delay_ms;
    }
    config.validate().context("Validating load settings")?;
    let table = table_name(args.table.as_deref(), &args.input.input)?;
    debug!("Effective load config: {config:?}");

    let sink = SqliteSink::new(&args.database, config.bulk_timeout(), config.bulk_batch_size);
    let json_logger = match &args.event_log {
        Some(path) => Some(JsonLinesLogger::open(path)?),
        None => None,
    };
    let logger: &dyn EventLogger = match &json_logger {
        Some(logger) => logger,
        None => &FacadeLogger,
    };

    let content = read(&args.input, &config)?;
    let file_name = io_utils::file_label(&args.input.input);
    let pipeline = Pipeline::new(&config, &sink).with_logger(logger);
    let result = match PreparedLoad::from_bytes(&content, &config) {
        Ok(prepared) => {
            if args.create_table {
                let sql = render_create_table(
                    &table,
                    &prepared.profiles,
                    &prepared.columns,
                    &config.load_timestamp_column,
                    &args.unique,
                )?;
                sink.execute_script(&sql)
                    .with_context(|| format!("Creating table '{table}' in {:?}", args.database))?;
                info!("Ensured table '{table}' exists");
            }
            pipeline.run_prepared(&file_name, &prepared, &table, &CancellationFlag::new())
        }
        Err(err) => pipeline.reject(&file_name, &err),
    };

    let summary = serde_json::to_string_pretty(&result).context("Serializing load result")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{summary}").context("Writing load result")?;

    match result.error {
        Some(error) => bail!("{error}"),
        None => {
            info!(
                "Loaded {} record(s) from '{file_name}' into '{table}' in {} batch(es)",
                result.records_processed, result.batches_processed
            );
            Ok(())
        }
    }
}
