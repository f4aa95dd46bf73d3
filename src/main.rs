//! CLI Entry Point for sinewave-bench
//!
//! Measures how fast a streaming endpoint delivers `sinewavesimple` channel updates for a
//! sweep of array sizes, one run at a time, and prints the observed frequencies.
//!
//! # Usage
//!
//! Run the configured sweep against a server:
//! ```bash
//! sinewave-bench run --config config/bench.toml --output results.csv
//! ```
//!
//! Measure one channel against the built-in simulator:
//! ```bash
//! sinewave-bench --sim single 1000 0.1 5000
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sinewave_bench::config::{BenchConfig, DEFAULT_CONFIG_PATH};
use sinewave_bench::logging::{self, LogFormat};
use sinewave_bench::probe::{RunSpec, SineWaveProbe};
use sinewave_bench::report::BenchReport;
use sinewave_bench::sequencer::RunSequencer;
use sinewave_bench::transport::graphql_ws::{GraphqlWsTransport, WsProtocol};
use sinewave_bench::transport::sim::SimTransport;
use sinewave_bench::transport::SubscriptionTransport;

#[derive(Parser)]
#[command(name = "sinewave-bench")]
#[command(about = "Subscription throughput harness for sine-wave channels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// WebSocket endpoint, overrides the configuration
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// WebSocket subprotocol, overrides the configuration
    #[arg(long, global = true, value_enum)]
    protocol: Option<WsProtocol>,

    /// Measure the in-process simulator instead of a server
    #[arg(long, global = true)]
    sim: bool,

    /// Log output format, overrides the configuration
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Write results to this file (.csv for CSV, otherwise JSON)
    #[arg(long, global = true)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every configured run in order
    Run,

    /// Measure a single channel
    Single {
        /// Number of array elements
        size: usize,
        /// Server update interval in seconds
        update_interval: f64,
        /// Measurement window in milliseconds
        window_ms: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = BenchConfig::load_from(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint.url = endpoint.clone();
    }
    if let Some(protocol) = cli.protocol {
        config.endpoint.protocol = protocol;
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    logging::init_from_config(&config)?;

    let specs = match cli.command {
        Commands::Run => config.runs.clone(),
        Commands::Single {
            size,
            update_interval,
            window_ms,
        } => {
            let spec = RunSpec::new(size, update_interval, window_ms);
            spec.validate()?;
            vec![spec]
        }
    };

    let (transport, ws, label): (Arc<dyn SubscriptionTransport>, Option<GraphqlWsTransport>, String) =
        if cli.sim {
            tracing::info!("Using in-process simulator");
            (Arc::new(SimTransport::new()), None, "simulator".to_string())
        } else {
            let ws = GraphqlWsTransport::connect(
                &config.endpoint.url,
                config.endpoint.protocol,
                config.endpoint.ack_timeout(),
            )
            .await
            .with_context(|| format!("connecting to {}", config.endpoint.url))?;
            tracing::info!(endpoint = ws.endpoint(), protocol = %ws.protocol(), "Connected");
            let label = format!("{} ({})", ws.endpoint(), ws.protocol());
            (Arc::new(ws.clone()), Some(ws), label)
        };

    let probe = SineWaveProbe::new(transport, config.endpoint.ack_timeout())
        .with_unsubscribe_grace(config.endpoint.unsubscribe_timeout());
    let started_at = Utc::now();
    let outcomes = RunSequencer::new(probe).run_all(&specs).await;

    if let Some(ws) = ws {
        ws.close().await;
    }

    let report = BenchReport::new(label, started_at, &outcomes);
    println!("{}", report.render());

    if let Some(path) = &cli.output {
        report
            .export(path)
            .with_context(|| format!("writing results to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Results written");
    }

    Ok(())
}
