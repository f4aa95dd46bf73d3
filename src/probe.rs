//! One end-to-end sine-wave throughput run.
//!
//! A probe subscribes to `sim://sinewavesimple(size,update_interval)`, measures for the
//! run's window, checks every payload against the expected value set, and reports the
//! observed message frequency.
//!
//! The subscription acknowledgment wait is bounded by the probe's `ack_timeout`; a run
//! whose subscription is not acknowledged in time fails with
//! [`RunError::SubscriptionTimeout`] instead of hanging the sequence.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::channel::ChannelId;
use crate::error::{RunError, TransportError};
use crate::payload::{decode, validate, ExpectedSet};
use crate::transport::SubscriptionTransport;
use crate::window::{frequency_hz, MeasurementWindow, StreamState};

/// Per-run anomalies logged at warn level before switching to debug.
const ANOMALY_LOG_LIMIT: u64 = 10;

/// Parameters of one benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Number of array elements the generator produces.
    pub size: usize,
    /// Server-side emission cadence in seconds.
    pub update_interval: f64,
    /// Measurement window in milliseconds.
    pub window_ms: u64,
}

impl RunSpec {
    /// Create a run spec.
    pub fn new(size: usize, update_interval: f64, window_ms: u64) -> Self {
        Self {
            size,
            update_interval,
            window_ms,
        }
    }

    /// Reject parameters the generator cannot serve.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.size == 0 {
            return Err(RunError::InvalidSpec("size must be positive".into()));
        }
        if !self.update_interval.is_finite() || self.update_interval <= 0.0 {
            return Err(RunError::InvalidSpec(format!(
                "update_interval must be a positive number of seconds, got {}",
                self.update_interval
            )));
        }
        Ok(())
    }

    /// Channel this run subscribes to.
    pub fn channel(&self) -> ChannelId {
        ChannelId::sinewave_simple(self.size, self.update_interval)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Parameters the run was measured with.
    pub spec: RunSpec,
    /// Updates received inside the window.
    pub message_count: u64,
    /// Measured window length in seconds.
    pub elapsed_seconds: f64,
    /// `message_count / elapsed_seconds`.
    pub frequency_hz: f64,
    /// Updates whose payload could not be decoded.
    pub decode_errors: u64,
    /// Updates that decoded but did not carry the expected value set.
    pub validation_anomalies: u64,
}

/// Measures a single sine-wave subscription.
#[derive(Clone)]
pub struct SineWaveProbe {
    transport: Arc<dyn SubscriptionTransport>,
    ack_timeout: Duration,
    unsubscribe_grace: Duration,
}

impl SineWaveProbe {
    /// Probe using `transport`, waiting at most `ack_timeout` for each subscription.
    pub fn new(transport: Arc<dyn SubscriptionTransport>, ack_timeout: Duration) -> Self {
        Self {
            transport,
            ack_timeout,
            unsubscribe_grace: Duration::from_secs(1),
        }
    }

    /// How long to wait for the transport to confirm each unsubscribe.
    pub fn with_unsubscribe_grace(mut self, grace: Duration) -> Self {
        self.unsubscribe_grace = grace;
        self
    }

    /// Run one measurement.
    pub async fn measure(&self, spec: &RunSpec) -> Result<RunResult, RunError> {
        spec.validate()?;
        let expected = ExpectedSet::for_size(spec.size);
        let channel = spec.channel();

        tracing::info!(
            elements = spec.size,
            update_interval_s = spec.update_interval,
            measurement_s = spec.window_ms as f64 / 1000.0,
            "Measuring sinewave"
        );

        let subscription = match timeout(self.ack_timeout, self.transport.subscribe(&channel)).await {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => return Err(RunError::Subscription(e)),
            Err(_) => {
                return Err(RunError::SubscriptionTimeout {
                    channel: channel.to_string(),
                    timeout: self.ack_timeout,
                })
            }
        };

        let mut decode_errors = 0u64;
        let mut validation_anomalies = 0u64;
        let window = MeasurementWindow::new(spec.window_ms).with_unsubscribe_grace(self.unsubscribe_grace);

        let report = window
            .run(subscription, |message| match decode(message) {
                Ok(values) => {
                    if !validate(&values, &expected) {
                        validation_anomalies += 1;
                        if validation_anomalies <= ANOMALY_LOG_LIMIT {
                            tracing::warn!(
                                expected = expected.len(),
                                received = values.len(),
                                "Payload does not hold the expected value set"
                            );
                        } else {
                            tracing::debug!("Payload does not hold the expected value set");
                        }
                    }
                }
                Err(e) => {
                    decode_errors += 1;
                    if decode_errors <= ANOMALY_LOG_LIMIT {
                        tracing::warn!(error = %e, "Failed to decode payload");
                    } else {
                        tracing::debug!(error = %e, "Failed to decode payload");
                    }
                }
            })
            .await;

        if let StreamState::Failed(reason) = report.stream {
            return Err(RunError::Subscription(TransportError::Rejected {
                channel: channel.to_string(),
                reason,
            }));
        }

        let elapsed_seconds = report.elapsed.as_secs_f64();
        let result = RunResult {
            spec: *spec,
            message_count: report.count,
            elapsed_seconds,
            frequency_hz: frequency_hz(report.count, elapsed_seconds),
            decode_errors,
            validation_anomalies,
        };

        if decode_errors > 0 || validation_anomalies > 0 {
            tracing::warn!(decode_errors, validation_anomalies, "Run finished with payload anomalies");
        }
        tracing::info!(
            final_count = result.message_count,
            execution_time_s = result.elapsed_seconds,
            frequency_hz = result.frequency_hz,
            "Measured frequency: {:.3} Hz",
            result.frequency_hz
        );
        Ok(result)
    }
}

impl std::fmt::Debug for SineWaveProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SineWaveProbe")
            .field("ack_timeout", &self.ack_timeout)
            .field("unsubscribe_grace", &self.unsubscribe_grace)
            .finish_non_exhaustive()
    }
}
