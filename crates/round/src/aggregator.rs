//! Cross-plugin price aggregation
//!
//! One value per symbol per round: the median of every plugin's
//! observation, provided enough plugins contributed.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use oracle_core::{AggregatedPrice, AggregationSettings, PriceObservation, RoundId, Symbol};
use oracle_plugins::PluginFetch;

/// Aggregation policy
#[derive(Debug, Clone, Copy)]
pub struct AggregationPolicy {
    /// Fewer observations than this and the symbol is bad for the round
    pub min_sources: usize,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self { min_sources: 1 }
    }
}

impl From<&AggregationSettings> for AggregationPolicy {
    fn from(s: &AggregationSettings) -> Self {
        Self {
            min_sources: s.min_sources.max(1),
        }
    }
}

/// Result of aggregating one round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAggregation {
    pub round: RoundId,
    pub prices: Vec<AggregatedPrice>,
    pub bad_symbols: BTreeSet<Symbol>,
}

impl RoundAggregation {
    pub fn price(&self, symbol: &Symbol) -> Option<&AggregatedPrice> {
        self.prices.iter().find(|p| &p.symbol == symbol)
    }
}

/// Median of `values`, averaging the two central ones for an even count
pub fn median(values: &mut [Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    values.sort();

    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        let (low, high) = (values[mid - 1], values[mid]);
        let mean = match low.checked_add(high) {
            Some(sum) => sum / Decimal::TWO,
            // Both are huge with the same sign, so their gap is small
            None => low + (high - low) / Decimal::TWO,
        };
        Some(mean)
    }
}

/// Median aggregator
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    policy: AggregationPolicy,
}

impl Aggregator {
    pub fn new(policy: AggregationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Aggregate one symbol, or None when too few sources reported it
    pub fn aggregate_symbol(
        &self,
        round: RoundId,
        symbol: &Symbol,
        observations: &[PriceObservation],
    ) -> Option<AggregatedPrice> {
        if observations.len() < self.policy.min_sources {
            debug!(
                round,
                symbol = %symbol,
                sources = observations.len(),
                min = self.policy.min_sources,
                "Insufficient sources"
            );
            return None;
        }

        let mut prices: Vec<Decimal> = observations.iter().map(|o| o.price).collect();
        let price = median(&mut prices)?;

        Some(AggregatedPrice {
            symbol: symbol.clone(),
            price,
            sources: observations.len(),
            round,
        })
    }

    /// Aggregate every tracked symbol across the round's plugin results.
    ///
    /// Each plugin counts once per symbol, with its newest observation.
    /// Observations for untracked symbols are ignored.
    pub fn aggregate(
        &self,
        round: RoundId,
        symbols: &[Symbol],
        fetches: &[PluginFetch],
    ) -> RoundAggregation {
        let mut by_symbol: BTreeMap<&Symbol, BTreeMap<&str, &PriceObservation>> = symbols
            .iter()
            .map(|s| (s, BTreeMap::new()))
            .collect();

        for fetch in fetches {
            for observation in &fetch.prices {
                let Some(per_plugin) = by_symbol.get_mut(&observation.symbol) else {
                    continue;
                };
                per_plugin
                    .entry(fetch.plugin.as_str())
                    .and_modify(|current| {
                        if observation.timestamp > current.timestamp {
                            *current = observation;
                        }
                    })
                    .or_insert(observation);
            }
        }

        let mut aggregation = RoundAggregation {
            round,
            ..Default::default()
        };
        for (symbol, per_plugin) in by_symbol {
            let observations: Vec<PriceObservation> = per_plugin.into_values().cloned().collect();
            match self.aggregate_symbol(round, symbol, &observations) {
                Some(price) => aggregation.prices.push(price),
                None => {
                    aggregation.bad_symbols.insert(symbol.clone());
                }
            }
        }
        aggregation
    }
}
