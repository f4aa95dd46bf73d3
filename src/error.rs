//! Custom error types for the harness.
//!
//! Errors are layered by how far they are allowed to propagate:
//!
//! - **`DecodeError`**: a single message could not be turned into a float64 array. The
//!   probe logs it, counts it, and keeps measuring.
//! - **`TransportError`**: the streaming connection failed (connect, handshake, protocol
//!   violation, closed socket). Returned by `SubscriptionTransport::subscribe`.
//! - **`RunError`**: a single benchmark run could not complete. The sequencer records it in
//!   the run's slot and moves on to the next run.
//! - **`BenchError`**: harness-level failures (configuration, I/O, export) that abort the
//!   whole invocation.
//!
//! Validation anomalies (a payload that decodes but carries the wrong value set) are not
//! errors at all; they are counted in `RunResult::validation_anomalies`.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the harness error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Failure to turn a message payload into a float64 array.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The `value` object does not have the expected shape.
    #[error("Malformed message payload: {0}")]
    Malformed(String),

    /// The update has no `base64Array` field.
    #[error("Message carries no base64Array value")]
    MissingArray,

    /// The `base64` text is not valid standard base64.
    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded buffer does not split into whole float64 elements.
    #[error("Byte length {0} is not a multiple of 8")]
    Misaligned(usize),

    /// The array declares an element type other than `FLOAT64`.
    #[error("Unsupported element type {0}; only FLOAT64 arrays are decoded")]
    UnsupportedType(String),
}

/// Failure of the streaming connection or of the subscription protocol.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The endpoint is not a valid URL.
    #[error("Invalid endpoint URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Socket-level failure reported by tungstenite.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server answered `connection_init` with `connection_error`.
    #[error("Server rejected the connection: {0}")]
    ConnectionRejected(String),

    /// Upgrade or `connection_ack` did not arrive in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The server sent a frame that breaks the subprotocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The server refused or aborted one subscription.
    #[error("Subscription rejected for {channel}: {reason}")]
    Rejected {
        /// Channel the subscription was for.
        channel: String,
        /// Server-supplied reason.
        reason: String,
    },

    /// The connection is gone.
    #[error("Connection closed")]
    Closed,

    /// A frame was not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of a single benchmark run. Never aborts the run sequence.
#[derive(Error, Debug)]
pub enum RunError {
    /// Subscribing failed, or the stream reported an error mid-window.
    #[error("Subscription failed: {0}")]
    Subscription(#[from] TransportError),

    /// The subscription was not acknowledged within the probe's bound.
    #[error("Subscription to {channel} not acknowledged within {timeout:?}")]
    SubscriptionTimeout {
        /// Channel the subscription was for.
        channel: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The run parameters cannot be served.
    #[error("Invalid run parameters: {0}")]
    InvalidSpec(String),
}

/// Harness-level failures.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Figment could not extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON export failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The tracing subscriber could not be installed.
    #[error("Logging initialization failed: {0}")]
    Logging(String),
}

impl RunError {
    /// Short category label used in reports and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Subscription(_) => "subscription",
            RunError::SubscriptionTimeout { .. } => "subscription_timeout",
            RunError::InvalidSpec(_) => "invalid_spec",
        }
    }
}
