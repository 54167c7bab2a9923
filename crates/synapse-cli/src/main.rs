//! Synapse - local knowledge store for conversations and reusable solutions.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use synapse_cli::{commands, config, logging, state};
use tracing::Level;

use commands::Command;
use config::Config;
use logging::{LogConfig, LogFormat};
use state::AppState;

/// Synapse - save, index, and search conversation records.
#[derive(Parser, Debug)]
#[command(name = "synapse")]
#[command(about = "Local knowledge store for conversations and reusable solutions")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the data directory (config and cache follow it unless configured)
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// More log output; repeat for debug (-vv) and trace (-vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Level for one target, e.g. "index=debug"; may be repeated
    #[arg(long = "log", value_name = "TARGET=LEVEL", value_parser = logging::parse_override, global = true)]
    log_overrides: Vec<(String, Level)>,

    #[arg(long = "log-format", value_name = "FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogConfig {
        verbosity: cli.verbose,
        quiet: cli.quiet,
        overrides: cli.log_overrides,
        format: cli.log_format,
    });

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(cli.data_dir.as_deref())?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = Some(data_dir);
    }

    let state = AppState::new(config)?;
    tracing::debug!(target: "synapse::cli", "Running {:?}", cli.command);

    let output = commands::run(&state, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
