//! Tracing setup for the harness.
//!
//! Events carry run parameters and measurements as structured fields, and every run
//! executes inside a `run` span (see [`crate::sequencer`]). With `log_run_timings` the
//! span's close event is logged as well, which gives each run's wall-clock duration
//! including subscribe and unsubscribe. `RUST_LOG` overrides the configured level.
//!
//! Logs go to stderr so the report on stdout stays machine-readable.
//!
//! # Example
//! ```no_run
//! use sinewave_bench::{config::BenchConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BenchConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(elements = 1000, "Measuring sinewave");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::BenchConfig;
use crate::error::{BenchError, BenchResult};

/// Console log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured output for interactive runs.
    #[default]
    Pretty,
    /// One line per event, no colours.
    Compact,
    /// One JSON object per event, including the current `run` span.
    Json,
}

/// Resolved logging settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Log a close event with the duration of every `run` span.
    pub run_timings: bool,
}

impl LoggingConfig {
    /// Settings taken from the `[application]` table.
    pub fn from_bench_config(config: &BenchConfig) -> BenchResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            run_timings: config.application.log_run_timings,
        })
    }
}

/// Install the global subscriber described by `config.application`.
pub fn init_from_config(config: &BenchConfig) -> BenchResult<()> {
    init(LoggingConfig::from_bench_config(config)?)
}

/// Install the global subscriber.
///
/// Does nothing if a subscriber is already installed, so tests may call it repeatedly.
pub fn init(config: LoggingConfig) -> BenchResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));
    let span_events = if config.run_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_span_events(span_events);
    let layer = match config.format {
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| BenchError::Logging(e.to_string()))
}

fn parse_log_level(level: &str) -> BenchResult<Level> {
    level.parse::<Level>().map_err(|_| {
        BenchError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}
