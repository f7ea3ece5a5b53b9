//! Simulated price plugin
//!
//! Quotes a fixed forex and crypto basket with a slow deterministic drift.
//! Useful for local networks and for exercising the node end to end.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use oracle_core::{unix_now, PluginConfig};
use oracle_plugins::protocol::{FetchPricesResult, WirePrice};
use oracle_plugins::sdk::{self, PriceProvider};

const VERSION: &str = "v0.1.0";

struct SimulatedProvider {
    config: PluginConfig,
    base: BTreeMap<&'static str, Decimal>,
}

impl SimulatedProvider {
    fn new(config: PluginConfig) -> Self {
        let base = BTreeMap::from([
            ("EUR/USD", dec!(1.0845)),
            ("JPY/USD", dec!(0.0067)),
            ("GBP/USD", dec!(1.2650)),
            ("AUD/USD", dec!(0.6550)),
            ("CAD/USD", dec!(0.7350)),
            ("SEK/USD", dec!(0.0950)),
            ("ATN/USD", dec!(1.0000)),
            ("NTN/USD", dec!(10.0000)),
            ("NTN/AUD", dec!(15.2672)),
            ("NTN/CAD", dec!(13.6054)),
            ("NTN/EUR", dec!(9.2208)),
            ("NTN/GBP", dec!(7.9051)),
            ("NTN/JPY", dec!(1492.5373)),
            ("NTN/SEK", dec!(105.2631)),
        ]);
        Self { config, base }
    }

    /// Drift of at most +/-0.3% that changes once a minute
    fn quote(&self, base: Decimal, now: i64) -> Decimal {
        let step = Decimal::from((now / 60).rem_euclid(7) - 3);
        (base + base * step * dec!(0.001)).round_dp(8)
    }
}

#[async_trait::async_trait]
impl PriceProvider for SimulatedProvider {
    fn name(&self) -> &str {
        if self.config.name.is_empty() {
            "simulated-plugin"
        } else {
            &self.config.name
        }
    }

    fn version(&self) -> &str {
        VERSION
    }

    async fn available_symbols(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.base.keys().map(|s| s.to_string()).collect())
    }

    async fn fetch(&self, symbols: &[String]) -> anyhow::Result<FetchPricesResult> {
        let now = unix_now();
        let mut result = FetchPricesResult::default();
        for symbol in symbols {
            match self.base.get(symbol.as_str()) {
                Some(base) => result.prices.push(WirePrice {
                    symbol: symbol.clone(),
                    price: self.quote(*base, now),
                    timestamp: now,
                }),
                None => result.bad_symbols.push(symbol.clone()),
            }
        }
        Ok(result)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sdk::init_plugin_logging();
    let config = sdk::load_plugin_config()?;
    sdk::serve(SimulatedProvider::new(config)).await
}
