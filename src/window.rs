//! Fixed-duration measurement window over a live subscription.
//!
//! The window owns the message counter for its run. It starts a monotonic timer, counts
//! every data event until the deadline, cancels the subscription, reads the timer, and
//! only then waits for the transport to confirm the close. The deadline branch of the select loop is polled first, so once the window has
//! expired no further event is counted even if one is already queued.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::payload::Message;
use crate::transport::{Subscription, SubscriptionEvent};

/// How the event stream looked when the window closed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    /// Still delivering when the deadline fired.
    Open,
    /// The server completed the stream before the deadline.
    Completed,
    /// The transport closed the stream before the deadline.
    Closed,
    /// The server reported an error; the window closed early.
    Failed(String),
}

/// Result of one measurement window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    /// Data events counted inside the window.
    pub count: u64,
    /// Measured time between window start and the cancel request.
    pub elapsed: Duration,
    /// Stream state at close.
    pub stream: StreamState,
    /// Whether the transport confirmed the unsubscribe within the grace period.
    pub unsubscribe_confirmed: bool,
}

impl WindowReport {
    /// Elapsed time in seconds.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// `count / elapsed_secs`, or 0 when nothing was counted.
    pub fn frequency_hz(&self) -> f64 {
        frequency_hz(self.count, self.elapsed_secs())
    }
}

/// Message rate; 0 when no messages were counted or no time was measured.
pub fn frequency_hz(count: u64, elapsed_secs: f64) -> f64 {
    if count == 0 || elapsed_secs <= 0.0 {
        0.0
    } else {
        count as f64 / elapsed_secs
    }
}

/// Counts messages on a subscription for a fixed wall-clock duration.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementWindow {
    duration: Duration,
    unsubscribe_grace: Duration,
}

impl MeasurementWindow {
    /// Window of `duration_ms` milliseconds.
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(duration_ms),
            unsubscribe_grace: Duration::from_secs(1),
        }
    }

    /// How long to wait for the transport to confirm the unsubscribe.
    pub fn with_unsubscribe_grace(mut self, grace: Duration) -> Self {
        self.unsubscribe_grace = grace;
        self
    }

    /// Nominal window length.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run the window, calling `on_message` for every counted update.
    ///
    /// The subscription is cancelled exactly once, whatever happened on the stream.
    pub async fn run<F>(&self, mut subscription: Subscription, mut on_message: F) -> WindowReport
    where
        F: FnMut(&Message),
    {
        let start = Instant::now();
        let deadline = sleep(self.duration);
        tokio::pin!(deadline);

        let mut count: u64 = 0;
        let mut stream = StreamState::Open;

        loop {
            let reading = stream == StreamState::Open;
            tokio::select! {
                biased;
                _ = &mut deadline => break,
                event = subscription.next_event(), if reading => match event {
                    Some(SubscriptionEvent::Data(message)) => {
                        on_message(&message);
                        count += 1;
                    }
                    Some(SubscriptionEvent::Complete) => {
                        tracing::debug!(count, "Stream completed inside window");
                        stream = StreamState::Completed;
                    }
                    Some(SubscriptionEvent::Error(reason)) => {
                        stream = StreamState::Failed(reason);
                        break;
                    }
                    None => {
                        tracing::debug!(count, "Stream closed inside window");
                        stream = StreamState::Closed;
                    }
                },
            }
        }

        // The counter is final from here on. The timer stops when the cancel request goes
        // out, not when the transport gets round to confirming it
        subscription.cancel();
        let elapsed = start.elapsed();
        let unsubscribe_confirmed = subscription.wait_closed(self.unsubscribe_grace).await;

        WindowReport {
            count,
            elapsed,
            stream,
            unsubscribe_confirmed,
        }
    }
}
