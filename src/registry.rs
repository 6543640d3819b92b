//! Channel registry mapping logical channels to wire identifiers.
//!
//! Two registry styles are supported behind one API:
//! - [`IdStrategy::ServerAssigned`]: the id is only known once the exchange
//!   acknowledges the subscription, so registration is two-phase (pending,
//!   then [`ChannelRegistry::bind`]).
//! - [`IdStrategy::Derived`]: the client computes the id from the channel's
//!   own fields (e.g. a topic string) and no handshake is needed.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{debug, warn};

use crate::models::{Channel, ChannelId};

/// How channel identifiers are obtained.
#[derive(Clone, Copy)]
pub enum IdStrategy {
    /// Ids arrive in the exchange's subscribe acknowledgement.
    ServerAssigned,
    /// Ids are computed deterministically by the client.
    Derived(fn(&Channel) -> ChannelId),
}

impl fmt::Debug for IdStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerAssigned => f.write_str("ServerAssigned"),
            Self::Derived(_) => f.write_str("Derived"),
        }
    }
}

/// Bidirectional `Channel` <-> `ChannelId` map for one connection.
#[derive(Debug)]
pub struct ChannelRegistry {
    strategy: IdStrategy,
    by_id: HashMap<ChannelId, Channel>,
    by_channel: HashMap<Channel, ChannelId>,
    pending: HashSet<Channel>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            by_id: HashMap::new(),
            by_channel: HashMap::new(),
            pending: HashSet::new(),
        }
    }

    /// Registers a channel, returning its id if one is already known.
    ///
    /// Idempotent: a channel that is already bound returns its existing id.
    /// With [`IdStrategy::ServerAssigned`] a new channel is recorded as
    /// pending and `None` is returned until [`bind`](Self::bind) is called.
    /// A derived id that already belongs to another channel is refused and
    /// `None` is returned; the existing mapping is kept.
    pub fn register(&mut self, channel: &Channel) -> Option<ChannelId> {
        if let Some(id) = self.by_channel.get(channel) {
            return Some(id.clone());
        }

        match self.strategy {
            IdStrategy::Derived(derive) => {
                let id = derive(channel);
                if let Some(owner) = self.by_id.get(&id) {
                    warn!(
                        %channel,
                        channel_id = %id,
                        owner = %owner,
                        "derived channel id already in use, refusing registration"
                    );
                    return None;
                }
                self.insert(channel.clone(), id.clone());
                Some(id)
            }
            IdStrategy::ServerAssigned => {
                self.pending.insert(channel.clone());
                None
            }
        }
    }

    /// Binds a server-assigned id to a channel, completing registration.
    ///
    /// Any previous mapping of either the channel or the id is replaced so
    /// that ids stay unique per connection.
    pub fn bind(&mut self, channel: &Channel, id: ChannelId) {
        if !self.pending.remove(channel) && !self.by_channel.contains_key(channel) {
            debug!(%channel, channel_id = %id, "binding channel that was not pending");
        }
        if let Some(old_id) = self.by_channel.remove(channel) {
            self.by_id.remove(&old_id);
        }
        if let Some(previous) = self.by_id.remove(&id) {
            warn!(
                channel_id = %id,
                previous = %previous,
                %channel,
                "channel id reassigned to a different channel"
            );
            self.by_channel.remove(&previous);
        }
        self.insert(channel.clone(), id);
    }

    fn insert(&mut self, channel: Channel, id: ChannelId) {
        self.by_id.insert(id.clone(), channel.clone());
        self.by_channel.insert(channel, id);
    }

    /// Resolves an id back to its channel.
    ///
    /// `None` signals a stale or foreign message that should be dropped.
    pub fn resolve(&self, id: &ChannelId) -> Option<&Channel> {
        self.by_id.get(id)
    }

    /// Returns the id bound to a channel, if any.
    pub fn id_of(&self, channel: &Channel) -> Option<&ChannelId> {
        self.by_channel.get(channel)
    }

    /// Returns `true` if the channel awaits a server-assigned id.
    pub fn is_pending(&self, channel: &Channel) -> bool {
        self.pending.contains(channel)
    }

    /// Removes the mapping for an id, returning its channel.
    ///
    /// If the channel has since been bound to a newer id, that binding is
    /// left in place.
    pub fn unregister(&mut self, id: &ChannelId) -> Option<Channel> {
        let channel = self.by_id.remove(id)?;
        if self.by_channel.get(&channel) == Some(id) {
            self.by_channel.remove(&channel);
        }
        Some(channel)
    }

    /// Removes a channel whether bound or pending, returning its id if bound.
    pub fn unregister_channel(&mut self, channel: &Channel) -> Option<ChannelId> {
        self.pending.remove(channel);
        let id = self.by_channel.remove(channel)?;
        self.by_id.remove(&id);
        Some(id)
    }

    /// Drops every mapping; ids do not survive a reconnect.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_channel.clear();
        self.pending.clear();
    }

    /// Number of bound channels.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelType;

    fn topic(channel: &Channel) -> ChannelId {
        ChannelId::Named(format!(
            "{}@{}",
            channel.symbol_or_empty(),
            channel.kind.as_str()
        ))
    }

    fn book(symbol: &str) -> Channel {
        Channel::new(ChannelType::OrderBook, symbol)
    }

    #[test]
    fn server_assigned_registration_is_two_phase() {
        let mut registry = ChannelRegistry::new(IdStrategy::ServerAssigned);
        let channel = book("BTC/USD");

        assert_eq!(registry.register(&channel), None);
        assert!(registry.is_pending(&channel));
        assert!(registry.resolve(&ChannelId::Numeric(7)).is_none());

        registry.bind(&channel, ChannelId::Numeric(7));
        assert!(!registry.is_pending(&channel));
        assert_eq!(registry.resolve(&ChannelId::Numeric(7)), Some(&channel));
        assert_eq!(registry.register(&channel), Some(ChannelId::Numeric(7)));
    }

    #[test]
    fn derived_registration_is_immediate_and_idempotent() {
        let mut registry = ChannelRegistry::new(IdStrategy::Derived(topic));
        let channel = book("ETH/USD");

        let id = registry.register(&channel).unwrap();
        assert_eq!(id, ChannelId::Named("ETH/USD@book".into()));
        assert_eq!(registry.register(&channel), Some(id.clone()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(&id), Some(&channel));
    }

    #[test]
    fn derived_id_collision_keeps_first_owner() {
        fn shared(_: &Channel) -> ChannelId {
            ChannelId::Named("executionreport".into())
        }
        let mut registry = ChannelRegistry::new(IdStrategy::Derived(shared));
        let first = Channel::new(ChannelType::Orders, "BTC/USD");
        let second = Channel::new(ChannelType::Orders, "ETH/USD");

        let id = registry.register(&first).unwrap();
        assert_eq!(registry.register(&second), None);
        assert_eq!(registry.resolve(&id), Some(&first));
        assert!(registry.id_of(&second).is_none());

        assert_eq!(registry.unregister_channel(&second), None);
        assert_eq!(registry.resolve(&id), Some(&first));
    }

    #[test]
    fn unknown_id_resolves_to_none() {
        let registry = ChannelRegistry::new(IdStrategy::ServerAssigned);
        assert!(registry.resolve(&ChannelId::Numeric(99)).is_none());
        assert!(registry.resolve(&ChannelId::Named("foo".into())).is_none());
    }

    #[test]
    fn rebinding_an_id_keeps_mapping_unique() {
        let mut registry = ChannelRegistry::new(IdStrategy::ServerAssigned);
        let btc = book("BTC/USD");
        let eth = book("ETH/USD");
        registry.register(&btc);
        registry.register(&eth);

        registry.bind(&btc, ChannelId::Numeric(1));
        registry.bind(&eth, ChannelId::Numeric(1));

        assert_eq!(registry.resolve(&ChannelId::Numeric(1)), Some(&eth));
        assert!(registry.id_of(&btc).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_both_directions() {
        let mut registry = ChannelRegistry::new(IdStrategy::ServerAssigned);
        let channel = book("BTC/USD");
        registry.register(&channel);
        registry.bind(&channel, ChannelId::Numeric(3));

        assert_eq!(registry.unregister(&ChannelId::Numeric(3)), Some(channel.clone()));
        assert!(registry.id_of(&channel).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unregistering_stale_id_keeps_newer_binding() {
        let mut registry = ChannelRegistry::new(IdStrategy::ServerAssigned);
        let channel = book("BTC/USD");
        registry.register(&channel);
        registry.bind(&channel, ChannelId::Numeric(1));
        registry.bind(&channel, ChannelId::Numeric(2));

        assert_eq!(registry.unregister(&ChannelId::Numeric(1)), None);
        assert_eq!(registry.id_of(&channel), Some(&ChannelId::Numeric(2)));
    }

    #[test]
    fn unregister_channel_drops_pending_entry() {
        let mut registry = ChannelRegistry::new(IdStrategy::ServerAssigned);
        let channel = book("BTC/USD");
        registry.register(&channel);

        assert_eq!(registry.unregister_channel(&channel), None);
        assert!(!registry.is_pending(&channel));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut registry = ChannelRegistry::new(IdStrategy::Derived(topic));
        registry.register(&book("BTC/USD"));
        registry.register(&book("ETH/USD"));
        registry.clear();
        assert!(registry.is_empty());
    }
}
