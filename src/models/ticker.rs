use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}
