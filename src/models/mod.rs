//! Normalized models shared by every exchange profile.
//!
//! Contains channel identity types, the channel identifier used on the
//! wire, and the [`MarketEvent`] enum delivered to subscription handlers.

pub mod balance;
pub mod book;
pub mod candle;
pub mod orders;
pub mod ticker;
pub mod trade;

use std::fmt;

use serde::Deserialize;

pub use balance::Balance;
pub use book::{BookChange, BookDelta, BookSide, BookSnapshot, LevelDelta, OrderBook, PriceLevel};
pub use candle::Candle;
pub use orders::{Order, OrderStatus, Position};
pub use ticker::Ticker;
pub use trade::Trade;

/// Logical channel kinds a client can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Ticker,
    Trades,
    OrderBook,
    /// OHLC candles; the channel `param` carries the interval.
    Candles,
    Balance,
    Orders,
    MyTrades,
    Positions,
}

impl ChannelType {
    /// All channel types in declaration order.
    pub const ALL: [ChannelType; 8] = [
        Self::Ticker,
        Self::Trades,
        Self::OrderBook,
        Self::Candles,
        Self::Balance,
        Self::Orders,
        Self::MyTrades,
        Self::Positions,
    ];

    /// Returns the canonical wire name of this channel type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trades => "trades",
            Self::OrderBook => "book",
            Self::Candles => "candles",
            Self::Balance => "balance",
            Self::Orders => "orders",
            Self::MyTrades => "myTrades",
            Self::Positions => "positions",
        }
    }

    /// Parses a canonical wire name back into a channel type.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Returns `true` for account channels that require authentication.
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Self::Balance | Self::Orders | Self::MyTrades | Self::Positions
        )
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical subscription target.
///
/// Two channels are equal iff kind, symbol and param are all equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub kind: ChannelType,
    pub symbol: Option<String>,
    /// Extra qualifier such as a candle interval or book precision.
    pub param: Option<String>,
}

impl Channel {
    /// Creates a symbol-scoped channel.
    #[must_use]
    pub fn new(kind: ChannelType, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: Some(symbol.into()),
            param: None,
        }
    }

    /// Creates an account-wide channel with no symbol (e.g. balances).
    #[must_use]
    pub fn account(kind: ChannelType) -> Self {
        Self {
            kind,
            symbol: None,
            param: None,
        }
    }

    /// Attaches a sub-parameter such as a candle interval.
    #[must_use]
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    /// Returns `true` if this channel requires an authenticated session.
    pub fn is_private(&self) -> bool {
        self.kind.is_private()
    }

    /// Returns the symbol, or an empty string for account-wide channels.
    pub fn symbol_or_empty(&self) -> &str {
        self.symbol.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.as_str())?;
        if let Some(symbol) = &self.symbol {
            write!(f, ":{symbol}")?;
        }
        if let Some(param) = &self.param {
            write!(f, ":{param}")?;
        }
        Ok(())
    }
}

/// Opaque identifier a channel is known by on one connection.
///
/// Some exchanges assign integers in their subscribe acknowledgement,
/// others address channels by a client-derived string topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Numeric(u64),
    Named(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self::Numeric(id)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// Trade or order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Side {
    #[serde(rename = "buy", alias = "BUY", alias = "Buy")]
    Buy,
    #[serde(rename = "sell", alias = "SELL", alias = "Sell")]
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// A normalized event delivered to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Ticker(Ticker),
    Trades(Vec<Trade>),
    /// Levels touched by one snapshot or delta message.
    Book(BookChange),
    Candle(Candle),
    Balances(Vec<Balance>),
    Orders(Vec<Order>),
    MyTrades(Vec<Trade>),
    Positions(Vec<Position>),
}

impl MarketEvent {
    /// Returns the channel type this event belongs to.
    pub fn kind(&self) -> ChannelType {
        match self {
            Self::Ticker(_) => ChannelType::Ticker,
            Self::Trades(_) => ChannelType::Trades,
            Self::Book(_) => ChannelType::OrderBook,
            Self::Candle(_) => ChannelType::Candles,
            Self::Balances(_) => ChannelType::Balance,
            Self::Orders(_) => ChannelType::Orders,
            Self::MyTrades(_) => ChannelType::MyTrades,
            Self::Positions(_) => ChannelType::Positions,
        }
    }
}
