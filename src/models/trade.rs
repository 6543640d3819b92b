//! Public and private trade models.

use rust_decimal::Decimal;

use super::Side;

/// A single executed trade.
///
/// Public trades leave `order_id` and `fee` empty; the `MyTrades` channel
/// fills them in for the account's own fills.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub amount: Decimal,
    pub timestamp: i64,
    pub order_id: Option<String>,
    pub fee: Option<Decimal>,
}
