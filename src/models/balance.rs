//! Account balance models.

use rust_decimal::Decimal;

/// Balance of one currency in the account.
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub currency: String,
    pub total: Decimal,
    pub available: Decimal,
}

impl Balance {
    /// Amount locked in open orders or otherwise unavailable.
    pub fn used(&self) -> Decimal {
        self.total - self.available
    }
}
