//! OHLC candlestick models.

use rust_decimal::Decimal;

/// A single OHLC candlestick bar.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    /// Interval label as requested in the channel param (e.g. `"1m"`).
    pub interval: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Start timestamp of this candle's time window.
    pub timestamp: i64,
}
