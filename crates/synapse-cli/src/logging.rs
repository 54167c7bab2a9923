//! Log setup for the CLI.
//!
//! Logs go to stderr so stdout carries nothing but the command's JSON.
//! `RUST_LOG`, when set, replaces the flag-derived filter entirely.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TARGET_PREFIX: &str = "synapse::";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Filter settings gathered from the command line.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Number of `-v` flags: 1 shows every store and index change, 2 adds
    /// debug detail, 3 or more traces lock traffic and temp-file writes.
    pub verbosity: u8,
    /// Errors only, plus synapse warnings. Wins over `verbosity`.
    pub quiet: bool,
    /// Per-target levels from `--log`, applied after the base filter.
    pub overrides: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl LogConfig {
    pub fn build_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(self.directives().join(",")))
            .unwrap_or_else(|_| EnvFilter::new("warn"))
    }

    fn directives(&self) -> Vec<String> {
        let base: &[&str] = if self.quiet {
            &["error", "synapse=warn"]
        } else {
            match self.verbosity {
                // Setup and legacy-repair notices are worth seeing on every run.
                0 => &["warn", "synapse::cli=info", "synapse::init=info", "synapse::repair=info"],
                1 => &["warn", "synapse=info"],
                2 => &["warn", "synapse=debug", "synapse::lock=info"],
                _ => &["info", "synapse=trace"],
            }
        };

        base.iter()
            .map(|d| d.to_string())
            .chain(
                self.overrides
                    .iter()
                    .map(|(target, level)| format!("{}={}", target, level.as_str().to_lowercase())),
            )
            .collect()
    }
}

/// Parse one `--log TARGET=LEVEL` value. Bare targets such as `index` are
/// expanded to `synapse::index`.
pub fn parse_override(raw: &str) -> Result<(String, Level), String> {
    let (target, level) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TARGET=LEVEL, got '{}'", raw))?;

    let target = target.trim();
    if target.is_empty() {
        return Err(format!("missing target in '{}'", raw));
    }
    let level = level
        .trim()
        .parse::<Level>()
        .map_err(|_| format!("unknown log level '{}'", level.trim()))?;

    let target = if target == "synapse" || target.starts_with(TARGET_PREFIX) {
        target.to_string()
    } else {
        format!("{}{}", TARGET_PREFIX, target)
    };
    Ok((target, level))
}

pub fn init(config: &LogConfig) {
    let registry = tracing_subscriber::registry().with(config.build_filter());
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    match config.format {
        LogFormat::Text => registry.with(layer).init(),
        LogFormat::Json => registry.with(layer.json()).init(),
    }
}
