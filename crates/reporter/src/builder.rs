//! Report builder

use alloy_primitives::U256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::error;

use oracle_core::{AggregatedPrice, RoundId, Symbol};

/// One symbol's line in a round report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub symbol: Symbol,
    pub price: Decimal,
    /// `trunc(price * precision)`, as stored by the contract
    pub scaled: U256,
    pub sources: usize,
}

/// Prices reported for one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub round: RoundId,
    pub entries: Vec<ReportEntry>,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.iter().map(|e| e.symbol.clone()).collect()
    }
}

/// Turns aggregated prices into a report at the contract's precision
#[derive(Debug, Clone, Copy)]
pub struct ReportBuilder {
    precision: u64,
}

impl ReportBuilder {
    pub fn new(precision: u64) -> Self {
        Self { precision }
    }

    pub fn precision(&self) -> u64 {
        self.precision
    }

    /// Integer form of `price`, or None if negative or out of range
    pub fn scale(&self, price: Decimal) -> Option<U256> {
        if price.is_sign_negative() && !price.is_zero() {
            return None;
        }
        let scaled = price.checked_mul(Decimal::from(self.precision))?.trunc();
        scaled.to_u128().map(U256::from)
    }

    /// Build a report, sorted by symbol. Prices that cannot be encoded are left out.
    pub fn build(&self, round: RoundId, prices: &[AggregatedPrice]) -> Report {
        let mut entries: Vec<ReportEntry> = prices
            .iter()
            .filter_map(|p| match self.scale(p.price) {
                Some(scaled) => Some(ReportEntry {
                    symbol: p.symbol.clone(),
                    price: p.price,
                    scaled,
                    sources: p.sources,
                }),
                None => {
                    error!(round, symbol = %p.symbol, price = %p.price, "Price cannot be encoded, dropping");
                    None
                }
            })
            .collect();

        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Report { round, entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn aggregated(symbol: &str, price: Decimal) -> AggregatedPrice {
        AggregatedPrice {
            symbol: Symbol::new(symbol),
            price,
            sources: 3,
            round: 9,
        }
    }

    #[test]
    fn test_scale_truncates() {
        let builder = ReportBuilder::new(10_000_000);
        assert_eq!(builder.scale(dec!(1.08456789)), Some(U256::from(10_845_678u64)));
        assert_eq!(builder.scale(dec!(0)), Some(U256::ZERO));
        assert_eq!(builder.scale(dec!(-1.5)), None);
    }

    #[test]
    fn test_scale_overflow() {
        let builder = ReportBuilder::new(u64::MAX);
        assert_eq!(builder.scale(Decimal::MAX), None);
    }

    #[test]
    fn test_build_sorts_and_drops_unencodable() {
        let builder = ReportBuilder::new(100);
        let report = builder.build(
            9,
            &[
                aggregated("NTN-USD", dec!(10.129)),
                aggregated("BAD-USD", dec!(-3)),
                aggregated("ATN-USD", dec!(1)),
            ],
        );

        assert_eq!(report.round, 9);
        assert_eq!(report.symbols(), vec![Symbol::new("ATN-USD"), Symbol::new("NTN-USD")]);
        assert_eq!(report.entries[1].scaled, U256::from(1012u64));
        assert_eq!(report.entries[1].sources, 3);
    }
}
