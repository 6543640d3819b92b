//! Desired subscriptions and their handlers.
//!
//! The [`SubscriptionManager`] is the source of truth for what the client
//! wants to receive. It survives reconnects: on every new session the
//! connection replays the recorded channels in the order they were first
//! requested. Several handlers may watch the same channel; only one wire
//! subscription exists per channel.
//!
//! - [`queue`] - Bounded drop-oldest queues feeding each handler

pub mod queue;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::models::{Channel, MarketEvent};

pub use queue::{EventSink, StreamFailure, Subscription, Update, bounded};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Allocates a process-unique handle.
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of one wire subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Requested (or waiting to be requested) but not yet acknowledged.
    Pending,
    Active,
    /// The last handler left; waiting for the exchange to confirm.
    Unsubscribing,
}

/// What the current session allows to be put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gate {
    pub ready: bool,
    pub authenticated: bool,
}

impl Gate {
    pub fn allows(&self, private: bool) -> bool {
        self.ready && (!private || self.authenticated)
    }
}

/// Outcome of removing a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub channel: Channel,
    /// `true` if the exchange must be told to stop sending this channel.
    pub wire: bool,
}

#[derive(Debug)]
struct Entry {
    channel: Channel,
    private: bool,
    state: SubscriptionState,
    /// Whether a subscribe frame went out on the current connection.
    sent: bool,
    handlers: Vec<EventSink>,
}

/// Ordered set of subscriptions for one client.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    entries: Vec<Entry>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, channel: &Channel) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.channel == channel)
    }

    fn entry_mut(&mut self, channel: &Channel) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| &entry.channel == channel)
    }

    /// Adds a handler for `channel`.
    ///
    /// Returns the channel to put on the wire, or `None` when either an
    /// identical subscription already exists or the gate is closed (the
    /// channel is then sent later by [`replay`](Self::replay)).
    pub fn subscribe(&mut self, channel: Channel, sink: EventSink, gate: Gate) -> Option<Channel> {
        let private = channel.is_private();
        if let Some(entry) = self.entry_mut(&channel) {
            debug!(%channel, handle = %sink.handle(), "Attaching handler to existing subscription");
            entry.handlers.push(sink);
            if entry.state != SubscriptionState::Unsubscribing {
                return None;
            }
            // Revived while the exchange was tearing it down.
            entry.state = SubscriptionState::Pending;
            entry.sent = false;
            if gate.allows(private) {
                entry.sent = true;
                return Some(channel);
            }
            return None;
        }

        let send = gate.allows(private);
        info!(%channel, private, deferred = !send, "Adding subscription");
        self.entries.push(Entry {
            channel: channel.clone(),
            private,
            state: SubscriptionState::Pending,
            sent: send,
            handlers: vec![sink],
        });
        send.then_some(channel)
    }

    /// Removes one handler.
    ///
    /// When the last handler leaves, the subscription is dropped locally, or
    /// kept as `Unsubscribing` if `await_confirmation` is set and the
    /// exchange knows about it. Returns `None` for an unknown handle.
    pub fn unsubscribe(
        &mut self,
        handle: SubscriptionHandle,
        await_confirmation: bool,
    ) -> Option<Removal> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.handlers.iter().any(|sink| sink.handle() == handle))?;
        let entry = &mut self.entries[index];
        entry.handlers.retain(|sink| sink.handle() != handle);
        let channel = entry.channel.clone();

        if !entry.handlers.is_empty() {
            debug!(%channel, %handle, remaining = entry.handlers.len(), "Detached handler");
            return Some(Removal {
                channel,
                wire: false,
            });
        }

        let wire = entry.sent;
        if wire && await_confirmation {
            entry.state = SubscriptionState::Unsubscribing;
        } else {
            self.entries.remove(index);
        }
        info!(%channel, %handle, wire, "Removed subscription");
        Some(Removal { channel, wire })
    }

    /// Completes an unsubscribe confirmed by the exchange.
    ///
    /// Returns `false` if the channel was revived in the meantime.
    pub fn on_unsubscribed(&mut self, channel: &Channel) -> bool {
        match self.position(channel) {
            Some(index) if self.entries[index].state == SubscriptionState::Unsubscribing => {
                self.entries.remove(index);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Marks a subscription as acknowledged.
    pub fn on_ack(&mut self, channel: &Channel) -> bool {
        match self.entry_mut(channel) {
            Some(entry) if entry.state == SubscriptionState::Pending => {
                entry.state = SubscriptionState::Active;
                true
            }
            Some(_) => false,
            None => {
                debug!(%channel, "Acknowledgement for unknown subscription");
                false
            }
        }
    }

    /// Drops a subscription the exchange refused, telling every handler why.
    ///
    /// Returns the number of handlers notified.
    pub fn on_reject(&mut self, channel: &Channel, reason: &str) -> usize {
        let Some(index) = self.position(channel) else {
            return 0;
        };
        let entry = self.entries.remove(index);
        warn!(%channel, reason, handlers = entry.handlers.len(), "Subscription rejected");
        let failure = StreamFailure::Subscription {
            channel: channel.clone(),
            reason: reason.to_string(),
        };
        for sink in &entry.handlers {
            sink.push(Update::Failed(failure.clone()));
        }
        entry.handlers.len()
    }

    /// Drops every private subscription after a failed login.
    ///
    /// Returns the channels removed.
    pub fn fail_private(&mut self, reason: &str) -> Vec<Channel> {
        let failure = StreamFailure::Authentication(reason.to_string());
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if !entry.private {
                return true;
            }
            for sink in &entry.handlers {
                sink.push(Update::Failed(failure.clone()));
            }
            removed.push(entry.channel.clone());
            false
        });
        if !removed.is_empty() {
            warn!(count = removed.len(), reason, "Dropped private subscriptions");
        }
        removed
    }

    /// Pushes an event to every handler of `channel`.
    ///
    /// Returns the handles whose consumer has gone away.
    pub fn dispatch(&self, channel: &Channel, event: &MarketEvent) -> Vec<SubscriptionHandle> {
        let Some(entry) = self.entries.iter().find(|entry| &entry.channel == channel) else {
            debug!(%channel, "No handlers for event");
            return Vec::new();
        };
        if entry.state == SubscriptionState::Unsubscribing {
            return Vec::new();
        }
        entry
            .handlers
            .iter()
            .filter(|sink| !sink.push(Update::Event(event.clone())))
            .map(EventSink::handle)
            .collect()
    }

    /// Returns every unsent channel the gate allows, in original order,
    /// marking them as sent.
    ///
    /// Private channels are held back until the gate reports an
    /// authenticated session.
    pub fn replay(&mut self, gate: Gate) -> Vec<Channel> {
        self.entries
            .iter_mut()
            .filter(|entry| {
                !entry.sent
                    && entry.state == SubscriptionState::Pending
                    && gate.allows(entry.private)
            })
            .map(|entry| {
                entry.sent = true;
                entry.channel.clone()
            })
            .collect()
    }

    /// Forgets all wire state after the connection drops.
    ///
    /// Subscriptions return to `Pending`; those already being torn down are
    /// dropped since the new connection will not know them.
    pub fn reset(&mut self) {
        self.entries
            .retain(|entry| entry.state != SubscriptionState::Unsubscribing);
        for entry in &mut self.entries {
            entry.state = SubscriptionState::Pending;
            entry.sent = false;
        }
    }

    pub fn state(&self, channel: &Channel) -> Option<SubscriptionState> {
        self.entries
            .iter()
            .find(|entry| &entry.channel == channel)
            .map(|entry| entry.state)
    }

    pub fn handler_count(&self, channel: &Channel) -> usize {
        self.entries
            .iter()
            .find(|entry| &entry.channel == channel)
            .map_or(0, |entry| entry.handlers.len())
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.position(channel).is_some()
    }

    /// Channels in the order they were first requested.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.entries.iter().map(|entry| &entry.channel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
