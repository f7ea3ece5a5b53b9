//! In-memory plugin doubles for testing.
//!
//! `MockSource` answers `state` and `fetch_prices` from a price table;
//! `MockLauncher` hands out registered sources and can be told to fail.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oracle_core::{unix_now, PluginError, PluginResult, UnixTimestamp};

use crate::protocol::{FetchPricesResult, StateResult, WirePrice};
use crate::source::{DataSource, PluginSpec, SourceLauncher};

/// Plugin answering from a fixed price table, keyed by native symbol
#[derive(Debug)]
pub struct MockSource {
    name: String,
    version: String,
    prices: RwLock<BTreeMap<String, Decimal>>,
    timestamp: RwLock<Option<UnixTimestamp>>,
    delay: RwLock<Duration>,
    alive: AtomicBool,
    fetch_calls: AtomicUsize,
}

impl MockSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "v0.0.1-mock".to_string(),
            prices: RwLock::new(BTreeMap::new()),
            timestamp: RwLock::new(None),
            delay: RwLock::new(Duration::ZERO),
            alive: AtomicBool::new(true),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Native symbols and their prices. The keys are the available set.
    pub fn with_prices<'a>(self, prices: impl IntoIterator<Item = (&'a str, Decimal)>) -> Self {
        *self.prices.write() = prices.into_iter().map(|(s, p)| (s.to_string(), p)).collect();
        self
    }

    /// Fixed vendor timestamp instead of the current time
    pub fn with_timestamp(self, timestamp: UnixTimestamp) -> Self {
        *self.timestamp.write() = Some(timestamp);
        self
    }

    /// Delay every `fetch_prices` answer
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().insert(symbol.to_string(), price);
    }

    pub fn remove_symbol(&self, symbol: &str) {
        self.prices.write().remove(symbol);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }

    /// A dead source fails every call as a closed channel
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> PluginResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(PluginError::ChannelClosed(self.name.clone()))
        }
    }
}

#[async_trait::async_trait]
impl DataSource for MockSource {
    async fn fetch_prices(&self, symbols: &[String]) -> PluginResult<FetchPricesResult> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_alive()?;

        let delay = *self.delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let timestamp = (*self.timestamp.read()).unwrap_or_else(unix_now);
        let prices = self.prices.read();
        let mut result = FetchPricesResult::default();
        for symbol in symbols {
            match prices.get(symbol) {
                Some(price) => result.prices.push(WirePrice {
                    symbol: symbol.clone(),
                    price: *price,
                    timestamp,
                }),
                None => result.bad_symbols.push(symbol.clone()),
            }
        }
        Ok(result)
    }

    async fn state(&self) -> PluginResult<StateResult> {
        self.ensure_alive()?;
        Ok(StateResult {
            version: self.version.clone(),
            available_symbols: self.prices.read().keys().cloned().collect(),
        })
    }

    async fn close(&self) {
        self.set_alive(false);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Launcher over a fixed set of `MockSource`s.
///
/// A successful launch revives the source, like a fresh process would.
#[derive(Debug, Default)]
pub struct MockLauncher {
    sources: HashMap<String, Arc<MockSource>>,
    failing: RwLock<HashSet<String>>,
    launches: RwLock<HashMap<String, usize>>,
}

impl MockLauncher {
    pub fn new(sources: impl IntoIterator<Item = Arc<MockSource>>) -> Self {
        Self {
            sources: sources
                .into_iter()
                .map(|s| (s.name().to_string(), s))
                .collect(),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut set = self.failing.write();
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Launch attempts for `name`, failed ones included
    pub fn launches(&self, name: &str) -> usize {
        self.launches.read().get(name).copied().unwrap_or(0)
    }

    pub fn source(&self, name: &str) -> Option<Arc<MockSource>> {
        self.sources.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl SourceLauncher for MockLauncher {
    async fn launch(&self, spec: &PluginSpec) -> PluginResult<Arc<dyn DataSource>> {
        *self.launches.write().entry(spec.name.clone()).or_insert(0) += 1;

        let spawn_err = |reason: &str| PluginError::Spawn {
            name: spec.name.clone(),
            reason: reason.to_string(),
        };
        if self.failing.read().contains(&spec.name) {
            return Err(spawn_err("launch disabled"));
        }
        let source = self
            .sources
            .get(&spec.name)
            .ok_or_else(|| spawn_err("no such mock source"))?;

        source.set_alive(true);
        Ok(Arc::clone(source) as Arc<dyn DataSource>)
    }
}
