//! Private order and position models.

use rust_decimal::Decimal;

use super::Side;

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Maps an exchange status string onto the normalized status.
    ///
    /// Unknown strings default to [`OrderStatus::Open`].
    pub fn from_wire(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "filled" | "closed" | "executed" => Self::Closed,
            "cancelled" | "canceled" => Self::Canceled,
            "rejected" => Self::Rejected,
            _ => Self::Open,
        }
    }
}

/// An update to one of the account's orders.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub status: OrderStatus,
    pub timestamp: i64,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.amount - self.filled
    }
}

/// An open derivatives position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Signed size: positive for long, negative for short.
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Option<Decimal>,
}
