//! Streaming transports and the subscription handle.
//!
//! A transport turns a [`ChannelId`] into a live [`Subscription`]: a queue of
//! [`SubscriptionEvent`]s plus a cancel request that fires exactly once. Two transports
//! are provided:
//!
//! - [`graphql_ws::GraphqlWsTransport`] talks to a real server over one WebSocket.
//! - [`sim::SimTransport`] generates `sinewavesimple` updates in-process.

pub mod graphql_ws;
pub mod sim;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::ChannelId;
use crate::error::TransportError;
pub use crate::payload::Message;

/// Capacity of the per-subscription event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Something that can open subscriptions on channels.
#[async_trait]
pub trait SubscriptionTransport: Send + Sync {
    /// Issue a subscribe request and return once it has been accepted.
    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, TransportError>;
}

/// One event delivered on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A channel update.
    Data(Message),
    /// The server reported an error for this operation. Terminal.
    Error(String),
    /// The server finished the stream. Terminal.
    Complete,
}

/// Fires the transport-specific cancel request.
pub trait Cancel: Send {
    /// Request cancellation. Called at most once per subscription.
    fn cancel(self: Box<Self>);
}

impl<F> Cancel for F
where
    F: FnOnce() + Send,
{
    fn cancel(self: Box<Self>) {
        (*self)()
    }
}

/// Handle to an active subscription.
///
/// The cancel request is held in an `Option` and taken by whichever of
/// [`Subscription::cancel`], [`Subscription::unsubscribe`] or `Drop` runs first, so it goes
/// out exactly once. `unsubscribe` and `wait_closed` consume the handle.
pub struct Subscription {
    channel: ChannelId,
    events: mpsc::Receiver<SubscriptionEvent>,
    canceller: Option<Box<dyn Cancel>>,
}

impl Subscription {
    /// Assemble a handle from a transport's event queue and cancel request.
    pub fn new(
        channel: ChannelId,
        events: mpsc::Receiver<SubscriptionEvent>,
        canceller: Box<dyn Cancel>,
    ) -> Self {
        Self {
            channel,
            events,
            canceller: Some(canceller),
        }
    }

    /// Channel this subscription was opened on.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Next event, or `None` once the transport has closed the stream.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Fire the cancel request without waiting for the transport.
    ///
    /// Only the first call has an effect. Events already queued stay readable until
    /// [`Subscription::wait_closed`] discards them.
    pub fn cancel(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller.cancel();
        }
    }

    /// Discard remaining events until the transport closes the stream.
    ///
    /// Cancels first if [`Subscription::cancel`] was not called. Returns `true` if the
    /// close was observed within `grace`.
    pub async fn wait_closed(mut self, grace: Duration) -> bool {
        self.cancel();
        let drained = tokio::time::timeout(grace, async {
            let mut discarded = 0usize;
            while let Some(event) = self.events.recv().await {
                if matches!(event, SubscriptionEvent::Complete) {
                    break;
                }
                discarded += 1;
            }
            discarded
        })
        .await;
        match drained {
            Ok(discarded) => {
                tracing::debug!(channel = %self.channel, discarded, "Unsubscribed");
                true
            }
            Err(_) => {
                tracing::warn!(
                    channel = %self.channel,
                    grace_ms = grace.as_millis() as u64,
                    "Unsubscribe not confirmed before grace period elapsed"
                );
                false
            }
        }
    }

    /// Cancel the subscription and wait for the transport to close the stream.
    ///
    /// Events still queued or arriving after the cancel request are discarded. Returns
    /// `true` if the close was observed within `grace`.
    pub async fn unsubscribe(mut self, grace: Duration) -> bool {
        self.cancel();
        self.wait_closed(grace).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            tracing::debug!(channel = %self.channel, "Subscription dropped, cancelling");
            canceller.cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel.to_string())
            .field("cancelled", &self.canceller.is_none())
            .finish()
    }
}
