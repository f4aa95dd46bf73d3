//! # Sine-Wave Subscription Benchmark
//!
//! This crate measures how quickly a publish/subscribe streaming endpoint delivers updates
//! of `sim://sinewavesimple(size,update_interval)` channels. For each run it subscribes,
//! counts the updates arriving in a fixed window, checks that every payload decodes to the
//! expected value set, unsubscribes, and reports the observed frequency.
//!
//! ## Crate Structure
//!
//! - **`channel`**: Formatting and parsing of `sim://generator(args)` channel ids.
//! - **`config`**: Figment-based configuration (endpoint, timeouts, run list).
//! - **`error`**: Error taxonomy, from per-message `DecodeError` up to `BenchError`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`payload`**: Base64 float64 array decoding and value-set validation.
//! - **`transport`**: The `SubscriptionTransport` trait and `Subscription` handle, with a
//!   GraphQL WebSocket implementation and an in-process simulator.
//! - **`window`**: The fixed-duration measurement window.
//! - **`probe`**: One end-to-end run (`SineWaveProbe`).
//! - **`sequencer`**: Strictly sequential execution of many runs.
//! - **`report`**: Console rendering and JSON/CSV export of results.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod payload;
pub mod probe;
pub mod report;
pub mod sequencer;
pub mod transport;
pub mod window;

pub use error::{BenchError, BenchResult, DecodeError, RunError, TransportError};
pub use probe::{RunResult, RunSpec, SineWaveProbe};
pub use sequencer::{RunOutcome, RunSequencer};
