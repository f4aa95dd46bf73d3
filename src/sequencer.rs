//! Sequential execution of benchmark runs.
//!
//! Runs share one transport connection, so they are executed strictly one after another:
//! run *i+1* is not subscribed until run *i*'s window has closed and its subscription has
//! been cancelled. A failed run is recorded in its slot and the sequence continues.

use tracing::Instrument;

use crate::error::RunError;
use crate::probe::{RunResult, RunSpec, SineWaveProbe};

/// Outcome of one slot in a run sequence.
#[derive(Debug)]
pub enum RunOutcome {
    /// The run completed and produced a measurement.
    Success(RunResult),
    /// The run failed; no measurement is available.
    Failure {
        /// Parameters of the failed run.
        spec: RunSpec,
        /// Why it failed.
        error: RunError,
    },
}

impl RunOutcome {
    /// Parameters of this slot.
    pub fn spec(&self) -> &RunSpec {
        match self {
            RunOutcome::Success(result) => &result.spec,
            RunOutcome::Failure { spec, .. } => spec,
        }
    }

    /// Measured frequency, `None` for failed runs.
    pub fn frequency_hz(&self) -> Option<f64> {
        match self {
            RunOutcome::Success(result) => Some(result.frequency_hz),
            RunOutcome::Failure { .. } => None,
        }
    }

    /// True for a completed run.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    /// The measurement, if the run completed.
    pub fn result(&self) -> Option<&RunResult> {
        match self {
            RunOutcome::Success(result) => Some(result),
            RunOutcome::Failure { .. } => None,
        }
    }

    /// The error, if the run failed.
    pub fn error(&self) -> Option<&RunError> {
        match self {
            RunOutcome::Success(_) => None,
            RunOutcome::Failure { error, .. } => Some(error),
        }
    }
}

/// Executes runs one at a time and accumulates their outcomes in order.
#[derive(Debug, Clone)]
pub struct RunSequencer {
    probe: SineWaveProbe,
}

impl RunSequencer {
    /// Sequencer driving `probe`.
    pub fn new(probe: SineWaveProbe) -> Self {
        Self { probe }
    }

    /// Execute every run in order; the output has one outcome per input spec.
    pub async fn run_all(&self, specs: &[RunSpec]) -> Vec<RunOutcome> {
        let total = specs.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, spec) in specs.iter().enumerate() {
            let span = tracing::info_span!(
                "run",
                index = index + 1,
                total,
                channel = %spec.channel()
            );
            let outcome = match self.probe.measure(spec).instrument(span.clone()).await {
                Ok(result) => RunOutcome::Success(result),
                Err(error) => {
                    span.in_scope(|| {
                        tracing::error!(
                            size = spec.size,
                            update_interval_s = spec.update_interval,
                            window_ms = spec.window_ms,
                            kind = error.kind(),
                            error = %error,
                            "Run failed"
                        );
                    });
                    RunOutcome::Failure { spec: *spec, error }
                }
            };
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        tracing::info!(runs = total, failed, "Run sequence finished");
        outcomes
    }
}
