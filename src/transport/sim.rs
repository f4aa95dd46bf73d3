//! In-process simulated server for `sim://sinewavesimple(size,interval)` channels.
//!
//! Mirrors the server-side `sinewavesimple` generator: on subscription the current array
//! `[0, 1, ..., size-1]` (float64) is delivered immediately, then every `interval`
//! seconds the array is rotated right by one element and delivered again.
//!
//! All timing uses `tokio::time`, so tests running with a paused clock are deterministic.
//!
//! # Fault injection
//!
//! [`SimOptions`] can delay the acknowledgment, reject channels, corrupt payload values
//! (validation anomalies), garble payload bytes (decode errors), or end the stream early.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::channel::{ChannelId, SINEWAVE_SIMPLE};
use crate::error::TransportError;
use crate::payload::{encode_f64, Message};
use crate::transport::{Subscription, SubscriptionEvent, SubscriptionTransport, EVENT_QUEUE_CAPACITY};

/// Fault injection and timing knobs for [`SimTransport`].
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    /// Delay before a subscription is acknowledged.
    pub ack_delay: Duration,
    /// Channel ids (as formatted strings) whose subscriptions are refused.
    pub rejected_channels: HashSet<String>,
    /// Every k-th update carries a value outside the expected set.
    pub corrupt_every: Option<usize>,
    /// Every k-th update carries a buffer whose length is not a multiple of 8.
    pub garble_every: Option<usize>,
    /// Send `Complete` after this many updates.
    pub end_after: Option<usize>,
}

#[derive(Debug, Default)]
struct SimStats {
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    delivered: AtomicUsize,
}

/// Simulated streaming server.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    options: SimOptions,
    stats: Arc<SimStats>,
}

impl SimTransport {
    /// Well-behaved simulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulator with fault injection.
    pub fn with_options(options: SimOptions) -> Self {
        Self {
            options,
            stats: Arc::default(),
        }
    }

    /// Delay every acknowledgment by `delay`.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.options.ack_delay = delay;
        self
    }

    /// Refuse subscriptions to `channel`.
    pub fn rejecting(mut self, channel: &ChannelId) -> Self {
        self.options.rejected_channels.insert(channel.to_string());
        self
    }

    /// Accepted subscriptions so far.
    pub fn subscribe_count(&self) -> usize {
        self.stats.subscribes.load(Ordering::SeqCst)
    }

    /// Cancel requests received so far.
    pub fn unsubscribe_count(&self) -> usize {
        self.stats.unsubscribes.load(Ordering::SeqCst)
    }

    /// Updates handed to subscribers so far.
    pub fn delivered_count(&self) -> usize {
        self.stats.delivered.load(Ordering::SeqCst)
    }

    fn parse(&self, channel: &ChannelId) -> Result<(usize, Duration), TransportError> {
        let reject = |reason: String| TransportError::Rejected {
            channel: channel.to_string(),
            reason,
        };

        if channel.generator() != SINEWAVE_SIMPLE {
            return Err(reject(format!("unknown generator '{}'", channel.generator())));
        }
        let [size, update] = channel.args() else {
            return Err(reject("expected (size, update_interval)".into()));
        };
        if !size.is_finite() || *size < 0.0 || size.fract() != 0.0 {
            return Err(reject(format!("invalid size {size}")));
        }
        if !update.is_finite() || *update <= 0.0 {
            return Err(reject(format!("invalid update interval {update}")));
        }
        if self.options.rejected_channels.contains(&channel.to_string()) {
            return Err(reject("channel refused by simulator".into()));
        }
        Ok((*size as usize, Duration::from_secs_f64(*update)))
    }
}

#[async_trait]
impl SubscriptionTransport for SimTransport {
    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, TransportError> {
        if !self.options.ack_delay.is_zero() {
            sleep(self.options.ack_delay).await;
        }
        let (size, period) = self.parse(channel)?;
        self.stats.subscribes.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let generator = Generator {
            id: channel.to_string(),
            values: (0..size).map(|i| i as f64).collect(),
            period,
            options: self.options.clone(),
            stats: self.stats.clone(),
        };
        tokio::spawn(generator.run(tx, stop_rx));

        let stats = self.stats.clone();
        let canceller = move || {
            stats.unsubscribes.fetch_add(1, Ordering::SeqCst);
            let _ = stop_tx.send(());
        };
        Ok(Subscription::new(channel.clone(), rx, Box::new(canceller)))
    }
}

struct Generator {
    id: String,
    values: Vec<f64>,
    period: Duration,
    options: SimOptions,
    stats: Arc<SimStats>,
}

impl Generator {
    async fn run(mut self, tx: mpsc::Sender<SubscriptionEvent>, mut stop: oneshot::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    if self.options.end_after.is_some_and(|n| sent >= n) {
                        let _ = tx.send(SubscriptionEvent::Complete).await;
                        break;
                    }
                    sent += 1;
                    let message = self.render(sent);
                    if tx.send(SubscriptionEvent::Data(message)).await.is_err() {
                        break;
                    }
                    self.stats.delivered.fetch_add(1, Ordering::SeqCst);
                    self.values.rotate_right(1);
                }
            }
        }
        tracing::trace!(channel = %self.id, sent, "Simulated stream stopped");
    }

    fn render(&self, nth: usize) -> Message {
        let hits = |every: Option<usize>| every.is_some_and(|k| k > 0 && nth % k == 0);

        let value = if hits(self.options.garble_every) {
            // 12 bytes: not a whole number of float64 elements
            json!({ "base64Array": { "numberType": "FLOAT64", "base64": "AAAAAAAAAAAAAAAA" } })
        } else if hits(self.options.corrupt_every) {
            let mut values = self.values.clone();
            match values.first_mut() {
                Some(first) => *first = -1.0,
                None => values.push(-1.0),
            }
            json!({ "base64Array": encode_f64(&values) })
        } else {
            json!({ "base64Array": encode_f64(&self.values) })
        };

        Message {
            id: Some(self.id.clone()),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::decode;

    #[tokio::test(start_paused = true)]
    async fn delivers_rotating_array() {
        let sim = SimTransport::new();
        let mut sub = sim.subscribe(&ChannelId::sinewave_simple(4, 0.1)).await.unwrap();

        let mut arrays = Vec::new();
        for _ in 0..3 {
            match sub.next_event().await {
                Some(SubscriptionEvent::Data(msg)) => arrays.push(decode(&msg).unwrap()),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(arrays[0], vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(arrays[1], vec![3.0, 0.0, 1.0, 2.0]);
        assert_eq!(arrays[2], vec![2.0, 3.0, 0.0, 1.0]);

        assert!(sub.unsubscribe(Duration::from_millis(100)).await);
        assert_eq!(sim.subscribe_count(), 1);
        assert_eq!(sim.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_generators_and_bad_args() {
        let sim = SimTransport::new();
        for channel in [
            ChannelId::new("sine", vec![-5.0, 5.0, 5.0, 0.1]),
            ChannelId::new(SINEWAVE_SIMPLE, vec![10.0]),
            ChannelId::sinewave_simple(10, 0.0),
        ] {
            let err = sim.subscribe(&channel).await.unwrap_err();
            assert!(matches!(err, TransportError::Rejected { .. }), "{err}");
        }
        assert_eq!(sim.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn rejects_configured_channel() {
        let refused = ChannelId::sinewave_simple(10, 0.1);
        let sim = SimTransport::new().rejecting(&refused);
        assert!(sim.subscribe(&refused).await.is_err());
        let sub = sim.subscribe(&ChannelId::sinewave_simple(11, 0.1)).await.unwrap();
        drop(sub);
        assert_eq!(sim.unsubscribe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ends_stream_after_limit() {
        let sim = SimTransport::with_options(SimOptions {
            end_after: Some(2),
            ..Default::default()
        });
        let mut sub = sim.subscribe(&ChannelId::sinewave_simple(2, 0.01)).await.unwrap();
        assert!(matches!(sub.next_event().await, Some(SubscriptionEvent::Data(_))));
        assert!(matches!(sub.next_event().await, Some(SubscriptionEvent::Data(_))));
        assert_eq!(sub.next_event().await, Some(SubscriptionEvent::Complete));
        assert_eq!(sub.next_event().await, None);
    }
}
