//! Bounded per-subscription update queues.
//!
//! The router pushes into an [`EventSink`] without ever waiting; the
//! consumer pulls from the matching [`Subscription`]. When the queue is full
//! the oldest undelivered update is discarded so a slow consumer only ever
//! loses stale data and never stalls the connection.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use super::SubscriptionHandle;
use crate::models::{Channel, MarketEvent};

/// A terminal failure reported to a subscription's consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamFailure {
    /// Private channel could not be opened because login failed or no
    /// credentials are configured.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The exchange rejected the subscribe request.
    #[error("subscription to {channel} rejected: {reason}")]
    Subscription { channel: Channel, reason: String },
}

/// One item delivered to a subscription consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Event(MarketEvent),
    Failed(StreamFailure),
}

/// Creates a linked sink/subscription pair holding at most `capacity` updates.
///
/// The capacity is rounded up to a power of two.
pub fn bounded(
    handle: SubscriptionHandle,
    channel: Channel,
    capacity: usize,
) -> (EventSink, Subscription) {
    let (sender, receiver) = broadcast::channel(capacity.max(1));
    (
        EventSink {
            handle,
            sender,
        },
        Subscription {
            handle,
            channel,
            receiver,
            dropped: 0,
        },
    )
}

/// Producer half held by the subscription manager.
#[derive(Debug)]
pub struct EventSink {
    handle: SubscriptionHandle,
    sender: broadcast::Sender<Update>,
}

impl EventSink {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Queues an update; a full queue overwrites its oldest entry.
    ///
    /// Returns `false` if the consumer has gone away.
    pub fn push(&self, update: Update) -> bool {
        self.sender.send(update).is_ok()
    }

    /// Returns `true` once the consumer has dropped its [`Subscription`].
    pub fn is_closed(&self) -> bool {
        self.sender.receiver_count() == 0
    }
}

/// Consumer half returned by `StreamClient::watch`.
///
/// Yields updates in arrival order; `recv` returns `None` once the
/// subscription is removed and every queued update has been read.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    channel: Channel,
    receiver: broadcast::Receiver<Update>,
    dropped: u64,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Number of updates discarded because this consumer fell behind.
    ///
    /// Counted when the consumer next reads past the gap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of updates waiting to be read.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Waits for the next update.
    pub async fn recv(&mut self) -> Option<Update> {
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next update without waiting, if one is queued.
    pub fn try_recv(&mut self) -> Option<Update> {
        loop {
            match self.receiver.try_recv() {
                Ok(update) => return Some(update),
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn lagged(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(
            channel = %self.channel,
            handle = %self.handle,
            skipped,
            dropped = self.dropped,
            "Subscriber is falling behind, dropped oldest updates"
        );
    }

    /// Waits for the next market event, skipping nothing.
    ///
    /// Returns `Err` with the failure if the subscription was terminated by
    /// the exchange, and `Ok(None)` once the stream has ended.
    pub async fn next_event(&mut self) -> Result<Option<MarketEvent>, StreamFailure> {
        match self.recv().await {
            Some(Update::Event(event)) => Ok(Some(event)),
            Some(Update::Failed(failure)) => Err(failure),
            None => Ok(None),
        }
    }
}

impl From<&Subscription> for SubscriptionHandle {
    fn from(subscription: &Subscription) -> Self {
        subscription.handle
    }
}
