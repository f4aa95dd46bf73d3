//! Aggregate report of a run sequence.
//!
//! Failed runs keep their slot: the frequency column is empty (`FAILED` on the console)
//! and the error text is carried alongside.

use std::fmt::Write as _;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult};
use crate::sequencer::RunOutcome;

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    /// 1-based position in the sequence.
    pub index: usize,
    /// Array elements.
    pub size: usize,
    /// Update interval in seconds.
    pub update_interval: f64,
    /// Nominal window in milliseconds.
    pub window_ms: u64,
    /// `ok` or `failed`.
    pub status: String,
    /// Messages counted; empty for failed runs.
    pub message_count: Option<u64>,
    /// Measured window in seconds; empty for failed runs.
    pub elapsed_seconds: Option<f64>,
    /// Measured frequency; empty for failed runs.
    pub frequency_hz: Option<f64>,
    /// Payloads that failed to decode.
    pub decode_errors: Option<u64>,
    /// Payloads with the wrong value set.
    pub validation_anomalies: Option<u64>,
    /// Error text for failed runs.
    pub error: Option<String>,
}

impl ReportRow {
    fn from_outcome(index: usize, outcome: &RunOutcome) -> Self {
        let spec = outcome.spec();
        let mut row = Self {
            index,
            size: spec.size,
            update_interval: spec.update_interval,
            window_ms: spec.window_ms,
            status: "ok".into(),
            message_count: None,
            elapsed_seconds: None,
            frequency_hz: None,
            decode_errors: None,
            validation_anomalies: None,
            error: None,
        };
        match outcome {
            RunOutcome::Success(result) => {
                row.message_count = Some(result.message_count);
                row.elapsed_seconds = Some(result.elapsed_seconds);
                row.frequency_hz = Some(result.frequency_hz);
                row.decode_errors = Some(result.decode_errors);
                row.validation_anomalies = Some(result.validation_anomalies);
            }
            RunOutcome::Failure { error, .. } => {
                row.status = "failed".into();
                row.error = Some(format!("{}: {}", error.kind(), error));
            }
        }
        row
    }
}

/// Report over a whole run sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    /// When the sequence started.
    pub started_at: DateTime<Utc>,
    /// Endpoint measured (or `simulator`).
    pub endpoint: String,
    /// One row per run, in run order.
    pub runs: Vec<ReportRow>,
}

impl BenchReport {
    /// Build a report from sequencer output.
    pub fn new(endpoint: impl Into<String>, started_at: DateTime<Utc>, outcomes: &[RunOutcome]) -> Self {
        Self {
            started_at,
            endpoint: endpoint.into(),
            runs: outcomes
                .iter()
                .enumerate()
                .map(|(i, outcome)| ReportRow::from_outcome(i + 1, outcome))
                .collect(),
        }
    }

    /// Number of failed runs.
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| r.frequency_hz.is_none()).count()
    }

    /// Console rendering: per-run table followed by the ordered frequency list.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "====================");
        let _ = writeln!(out, "Endpoint: {}", self.endpoint);
        let _ = writeln!(out, "Started:  {}", self.started_at.to_rfc3339());
        let _ = writeln!(
            out,
            "{:>3}  {:>10}  {:>8}  {:>9}  {:>8}  {:>10}  {:>13}  {:>9}",
            "#", "elements", "update_s", "window_s", "count", "elapsed_s", "frequency_hz", "anomalies"
        );
        for row in &self.runs {
            match (row.message_count, row.elapsed_seconds, row.frequency_hz) {
                (Some(count), Some(elapsed), Some(freq)) => {
                    let anomalies =
                        row.decode_errors.unwrap_or(0) + row.validation_anomalies.unwrap_or(0);
                    let _ = writeln!(
                        out,
                        "{:>3}  {:>10}  {:>8}  {:>9.3}  {:>8}  {:>10.3}  {:>13.3}  {:>9}",
                        row.index,
                        row.size,
                        row.update_interval,
                        row.window_ms as f64 / 1000.0,
                        count,
                        elapsed,
                        freq,
                        anomalies
                    );
                }
                _ => {
                    let _ = writeln!(
                        out,
                        "{:>3}  {:>10}  {:>8}  {:>9.3}  FAILED ({})",
                        row.index,
                        row.size,
                        row.update_interval,
                        row.window_ms as f64 / 1000.0,
                        row.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
        let _ = writeln!(out, "====================");
        let _ = writeln!(out, "Frequencies (Hz):");
        for row in &self.runs {
            match row.frequency_hz {
                Some(freq) => {
                    let _ = writeln!(out, "{freq}");
                }
                None => {
                    let _ = writeln!(out, "FAILED");
                }
            }
        }
        out
    }

    /// Write the report to `path`; `.csv` gets one row per run, anything else JSON.
    pub fn export(&self, path: &Path) -> BenchResult<()> {
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if is_csv {
            self.write_csv(path)
        } else {
            self.write_json(path)
        }
    }

    /// Pretty-printed JSON of the whole report.
    pub fn write_json(&self, path: &Path) -> BenchResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// CSV with a header line and one record per run.
    pub fn write_csv(&self, path: &Path) -> BenchResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in &self.runs {
            writer.serialize(row)?;
        }
        writer.flush().map_err(BenchError::Io)?;
        Ok(())
    }
}
