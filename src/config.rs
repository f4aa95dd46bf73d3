//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the standard sine-wave sweep against a local server)
//! 2. A TOML file (`config/bench.toml` unless another path is given)
//! 3. Environment variables prefixed with `SINEWAVE_BENCH_`, nested keys separated by `__`
//!    (e.g. `SINEWAVE_BENCH_ENDPOINT__URL=ws://daq-host:8000/subscriptions`)
//!
//! # Example
//! ```no_run
//! use sinewave_bench::config::BenchConfig;
//!
//! let config = BenchConfig::load()?;
//! println!("Endpoint: {}", config.endpoint.url);
//! # Ok::<(), sinewave_bench::error::BenchError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};
use crate::logging::LogFormat;
use crate::probe::RunSpec;
use crate::transport::graphql_ws::WsProtocol;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SINEWAVE_BENCH_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Streaming endpoint settings
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Runs to execute, in order
    #[serde(default = "default_runs")]
    pub runs: Vec<RunSpec>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Log each run's total duration when its span closes
    #[serde(default)]
    pub log_run_timings: bool,
}

/// Streaming endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL of the subscription endpoint
    #[serde(default = "default_url")]
    pub url: String,
    /// WebSocket subprotocol
    #[serde(default)]
    pub protocol: WsProtocol,
    /// Bound on connection and subscription acknowledgment, in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Wait for unsubscribe confirmation, in milliseconds
    #[serde(default = "default_unsubscribe_timeout")]
    pub unsubscribe_timeout_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_url() -> String {
    "ws://localhost:8000/subscriptions".to_string()
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_unsubscribe_timeout() -> u64 {
    1000
}

/// The standard sweep: 1 to 10 million elements at 0.1 s, 10 s per run.
pub fn default_runs() -> Vec<RunSpec> {
    [1, 10, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000]
        .into_iter()
        .map(|size| RunSpec::new(size, 0.1, 10_000))
        .collect()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_run_timings: false,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            protocol: WsProtocol::default(),
            ack_timeout_ms: default_ack_timeout(),
            unsubscribe_timeout_ms: default_unsubscribe_timeout(),
        }
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            endpoint: EndpointConfig::default(),
            runs: default_runs(),
        }
    }
}

impl EndpointConfig {
    /// Acknowledgment bound as a `Duration`.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Unsubscribe grace period as a `Duration`.
    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_timeout_ms)
    }
}

impl BenchConfig {
    /// Load from the default file location and the environment.
    pub fn load() -> BenchResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, exposed for inspection in tests.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BenchResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.endpoint.ack_timeout_ms == 0 {
            return Err(BenchError::Configuration(
                "ack_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.runs.is_empty() {
            return Err(BenchError::Configuration("No runs configured".to_string()));
        }

        for (i, run) in self.runs.iter().enumerate() {
            run.validate()
                .map_err(|e| BenchError::Configuration(format!("runs[{i}]: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_reproduce_standard_sweep() {
        let config = BenchConfig::default();
        assert_eq!(config.runs.len(), 8);
        assert_eq!(config.runs[0], RunSpec::new(1, 0.1, 10_000));
        assert_eq!(config.runs[7].size, 10_000_000);
        assert_eq!(config.endpoint.url, "ws://localhost:8000/subscriptions");
        assert_eq!(config.endpoint.protocol, WsProtocol::GraphqlWs);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn loads_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
log_format = "json"
log_run_timings = true

[endpoint]
url = "ws://daq-host:8080/ws"
protocol = "graphql-transport-ws"
ack_timeout_ms = 250

[[runs]]
size = 100
update_interval = 0.05
window_ms = 2000
"#
        )
        .unwrap();

        let config = BenchConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert!(config.application.log_run_timings);
        assert_eq!(config.endpoint.url, "ws://daq-host:8080/ws");
        assert_eq!(config.endpoint.protocol, WsProtocol::GraphqlTransportWs);
        assert_eq!(config.endpoint.ack_timeout(), Duration::from_millis(250));
        assert_eq!(config.endpoint.unsubscribe_timeout_ms, 1000);
        assert_eq!(config.runs, vec![RunSpec::new(100, 0.05, 2000)]);
    }

    #[test]
    #[serial]
    fn default_config_survives_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let rendered = toml::to_string(&BenchConfig::default()).unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        let config = BenchConfig::load_from(file.path()).unwrap();
        assert_eq!(config, BenchConfig::default());
    }

    #[test]
    #[serial]
    fn shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = BenchConfig::load_from(&path).unwrap();
        assert_eq!(config.runs, BenchConfig::default().runs);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("bench.toml", "[endpoint]\nurl = \"ws://from-file/ws\"\n")?;
            jail.set_env("SINEWAVE_BENCH_ENDPOINT__URL", "ws://from-env/ws");
            jail.set_env("SINEWAVE_BENCH_APPLICATION__LOG_LEVEL", "warn");

            let config = BenchConfig::load_from("bench.toml").expect("config loads");
            assert_eq!(config.endpoint.url, "ws://from-env/ws");
            assert_eq!(config.application.log_level, "warn");
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let config = BenchConfig::load_from("/nonexistent/bench.toml").unwrap();
        assert_eq!(config, BenchConfig::default());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = BenchConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = BenchConfig::default();
        config.endpoint.ack_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BenchConfig::default();
        config.runs.clear();
        assert!(config.validate().is_err());

        let mut config = BenchConfig::default();
        config.runs.push(RunSpec::new(0, 0.1, 1000));
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("runs[8]"), "{err}");
    }
}
