//! Exchange profiles.
//!
//! A profile is everything that differs between exchanges: how frames are
//! encoded, how inbound frames are classified, how payloads decode into
//! normalized models, and which id, sequencing and auth conventions apply.
//! The router and connection manager only ever talk to [`ExchangeProfile`].
//!
//! - [`channel_id`] - Server-assigned numeric channel ids with explicit acks
//! - [`topic`] - Client-derived string topics without subscribe acks

pub mod channel_id;
pub mod topic;

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{AuthScheme, LoginPayload};
use crate::book::SequencePolicy;
use crate::models::{BookDelta, BookSnapshot, Channel, ChannelId, MarketEvent, PriceLevel};
use crate::registry::IdStrategy;
use crate::router::Frame;
use crate::{Result, TickmuxError};

pub use channel_id::ChannelIdProfile;
pub use topic::TopicProfile;

/// A decoded channel payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
    Event(MarketEvent),
}

/// How a stale order book is refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resnapshot {
    /// Send this frame; the snapshot arrives on the existing channel.
    Request(String),
    /// Unsubscribe and subscribe again; the exchange resends a snapshot.
    Resubscribe,
}

/// Per-exchange wire conventions.
pub trait ExchangeProfile: Send + 'static {
    fn name(&self) -> &'static str;

    fn id_strategy(&self) -> IdStrategy;

    fn sequence_policy(&self) -> SequencePolicy;

    /// Maps a requested channel onto the one the exchange streams.
    ///
    /// Channels that share a wire id must map to the same value, so that
    /// they share one subscription.
    fn canonical_channel(&self, channel: Channel) -> Channel {
        channel
    }

    /// Whether the exchange answers subscribe requests before data flows.
    fn acknowledges_subscribe(&self) -> bool {
        matches!(self.id_strategy(), IdStrategy::ServerAssigned)
    }

    /// Whether the exchange confirms unsubscribe requests.
    fn confirms_unsubscribe(&self) -> bool {
        matches!(self.id_strategy(), IdStrategy::ServerAssigned)
    }

    fn auth_scheme(&self) -> AuthScheme;

    fn subscribe_request(&self, channel: &Channel) -> Result<String>;

    /// Encodes an unsubscribe, or `None` if the exchange cannot address the
    /// channel (e.g. no id has been assigned yet).
    fn unsubscribe_request(&self, channel: &Channel, id: Option<&ChannelId>)
    -> Result<Option<String>>;

    fn login_request(&self, payload: &LoginPayload) -> Result<String>;

    /// Application-level keepalive, or `None` to use WebSocket ping frames.
    fn ping_request(&self) -> Option<String>;

    fn resnapshot(&self, channel: &Channel) -> Resnapshot;

    /// Classifies one parsed inbound frame.
    fn classify(&self, frame: Value) -> Frame;

    /// Decodes a channel payload into normalized models.
    fn decode(&self, channel: &Channel, payload: Value) -> Result<Vec<Payload>>;
}

/// Built-in profiles selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileKind {
    #[default]
    ChannelId,
    Topic,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelId => "channel-id",
            Self::Topic => "topic",
        }
    }

    #[must_use]
    pub fn build(&self) -> Box<dyn ExchangeProfile> {
        match self {
            Self::ChannelId => Box::new(ChannelIdProfile),
            Self::Topic => Box::new(TopicProfile),
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileKind {
    type Err = TickmuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "channel-id" | "channelid" | "channel_id" => Ok(Self::ChannelId),
            "topic" => Ok(Self::Topic),
            other => Err(TickmuxError::Config(format!(
                "unknown profile '{other}', expected 'channel-id' or 'topic'"
            ))),
        }
    }
}

/// `[price, amount]` pair as sent by most exchanges, numbers or strings.
#[derive(Debug, Deserialize)]
pub(crate) struct WireLevel(pub Decimal, pub Decimal);

impl From<WireLevel> for PriceLevel {
    fn from(WireLevel(price, amount): WireLevel) -> Self {
        PriceLevel::new(price, amount)
    }
}

pub(crate) fn levels(wire: Vec<WireLevel>) -> Vec<PriceLevel> {
    wire.into_iter().map(PriceLevel::from).collect()
}

/// Requires the channel's symbol for symbol-scoped payloads.
pub(crate) fn symbol_of(channel: &Channel) -> Result<String> {
    channel
        .symbol
        .clone()
        .ok_or_else(|| TickmuxError::Protocol(format!("channel {channel} has no symbol")))
}

pub(crate) fn str_field<'a>(frame: &'a Value, key: &str) -> Option<&'a str> {
    frame.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_kind_parses_config_names() {
        assert_eq!("channel-id".parse::<ProfileKind>().unwrap(), ProfileKind::ChannelId);
        assert_eq!(" Topic ".parse::<ProfileKind>().unwrap(), ProfileKind::Topic);
        assert!("fix".parse::<ProfileKind>().is_err());
    }

    #[test]
    fn built_profiles_report_their_conventions() {
        let channel_id = ProfileKind::ChannelId.build();
        assert!(channel_id.acknowledges_subscribe());
        assert!(channel_id.confirms_unsubscribe());
        assert_eq!(channel_id.sequence_policy(), SequencePolicy::Strict);

        let topic = ProfileKind::Topic.build();
        assert!(!topic.acknowledges_subscribe());
        assert!(!topic.confirms_unsubscribe());
        assert_eq!(topic.sequence_policy(), SequencePolicy::Unchecked);
    }

    #[test]
    fn wire_levels_accept_strings_and_numbers() {
        let wire: Vec<WireLevel> =
            serde_json::from_value(serde_json::json!([["100.5", "2"], [99, 0.25]])).unwrap();
        let parsed = levels(wire);
        assert_eq!(parsed[0].price.to_string(), "100.5");
        assert_eq!(parsed[1].amount.to_string(), "0.25");
    }
}
