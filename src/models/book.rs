//! Order book models.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Side of the order book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// A single price level in the order book.
///
/// An `amount` of zero is a tombstone: the level is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

impl PriceLevel {
    #[must_use]
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }

    pub fn is_tombstone(&self) -> bool {
        self.amount.is_zero()
    }
}

impl From<(Decimal, Decimal)> for PriceLevel {
    fn from((price, amount): (Decimal, Decimal)) -> Self {
        Self { price, amount }
    }
}

/// An incremental change to one price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelDelta {
    pub side: BookSide,
    pub price: Decimal,
    pub amount: Decimal,
}

impl LevelDelta {
    #[must_use]
    pub fn new(side: BookSide, price: Decimal, amount: Decimal) -> Self {
        Self {
            side,
            price,
            amount,
        }
    }
}

/// A full book snapshot decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
    pub sequence: Option<i64>,
}

/// One incremental book message decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDelta {
    pub symbol: String,
    pub levels: Vec<LevelDelta>,
    pub timestamp: Option<i64>,
    pub sequence: Option<i64>,
}

/// Point-in-time copy of a reconstructed order book.
///
/// Bids are sorted by descending price, asks by ascending price, and no
/// price appears twice on the same side.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
    pub sequence: Option<i64>,
}

impl OrderBook {
    /// Returns the highest bid, if any.
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Returns the lowest ask, if any.
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    /// Returns `best_ask - best_bid`, or `None` if either side is empty.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Returns `(best_bid + best_ask) / 2`, or `None` if either side is empty.
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((bid + ask) / Decimal::from(2))
    }
}

/// The levels touched by one processed book message.
///
/// Deltas carry only the levels that changed (removed levels have a zero
/// amount); snapshots carry the whole book.
#[derive(Debug, Clone, PartialEq)]
pub struct BookChange {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
    pub sequence: Option<i64>,
    pub is_snapshot: bool,
}

impl BookChange {
    /// Returns `true` if the message did not change any level.
    pub fn is_empty(&self) -> bool {
        !self.is_snapshot && self.bids.is_empty() && self.asks.is_empty()
    }
}
