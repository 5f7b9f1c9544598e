use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Infer a schema from delimited text and bulk-load it", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Infer column profiles for a delimited file and print them as YAML
    Probe(ProbeArgs),
    /// Print the CREATE TABLE statement a load of the file would target
    Ddl(DdlArgs),
    /// Load a delimited file into a SQLite table in transactional batches
    Load(LoadArgs),
}

/// Options shared by every command that reads an input file.
#[derive(Debug, Args)]
pub struct InputArgs {
    /// Input delimited file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// YAML file with load settings; flags override its values
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
    /// Field delimiter (supports ',', 'tab', ';', '|'); inferred from the extension when omitted
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Quote character
    #[arg(long, value_parser = parse_quote)]
    pub quote: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// Write the YAML profiles to this file instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DdlArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// Target table name (defaults to the input file stem)
    #[arg(short = 't', long = "table")]
    pub table: Option<String>,
    /// Columns forming a uniqueness constraint, by original or sanitized name
    #[arg(short = 'u', long = "unique", value_delimiter = ',')]
    pub unique: Vec<String>,
}

#[derive(Debug, Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub input: InputArgs,
    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    pub database: PathBuf,
    /// Target table name (defaults to the input file stem)
    #[arg(short = 't', long = "table")]
    pub table: Option<String>,
    /// Create the target table before loading if it does not exist
    #[arg(long = "create-table")]
    pub create_table: bool,
    /// Columns forming a uniqueness constraint when creating the table
    #[arg(short = 'u', long = "unique", value_delimiter = ',', requires = "create_table")]
    pub unique: Vec<String>,
    /// Records per transactional batch
    #[arg(long = "batch-size")]
    pub batch_size: Option<usize>,
    /// Retries per batch after the first attempt
    #[arg(long = "max-retries")]
    pub max_retries: Option<u32>,
    /// Base retry delay in milliseconds; retry n waits n times this
    #[arg(long = "retry-delay-ms")]
    pub retry_delay_ms: Option<u64>,
    /// Append load events as JSON lines to this file
    #[arg(long = "event-log")]
    pub event_log: Option<PathBuf>,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => single_ascii(other, "Delimiter"),
    }
}

pub fn parse_quote(value: &str) -> Result<u8, String> {
    match value {
        "double" => Ok(b'"'),
        "single" => Ok(b'\''),
        other => single_ascii(other, "Quote"),
    }
}

fn single_ascii(value: &str, what: &str) -> Result<u8, String> {
    let mut chars = value.chars();
    let first = chars
        .next()
        .ok_or_else(|| format!("{what} cannot be empty"))?;
    if chars.next().is_some() {
        return Err(format!("{what} must be a single character"));
    }
    if !first.is_ascii() {
        return Err(format!("{what} must be ASCII"));
    }
    Ok(first as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_aliases_resolve() {
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert_eq!(parse_delimiter("semicolon"), Ok(b';'));
        assert_eq!(parse_delimiter("#"), Ok(b'#'));
        assert!(parse_delimiter("").is_err());
        assert!(parse_delimiter("ab").is_err());
        assert!(parse_delimiter("§").is_err());
    }

    #[test]
    fn quote_aliases_resolve() {
        assert_eq!(parse_quote("single"), Ok(b'\''));
        assert_eq!(parse_quote("\""), Ok(b'"'));
    }

    #[test]
    fn load_args_parse() {
        let cli = Cli::try_parse_from([
            "csv-loader",
            "load",
            "-i",
            "orders.csv",
            "-d",
            "db.sqlite",
            "--create-table",
            "--unique",
            "order_id,line",
            "--batch-size",
            "50",
        ])
        .unwrap();
        let Commands::Load(args) = cli.command else {
            panic!("expected load command");
        };
        assert_eq!(args.unique, vec!["order_id", "line"]);
        assert_eq!(args.batch_size, Some(50));
        assert!(args.table.is_none());
    }
}
