//! Per-plugin symbol resolution and price cache
//!
//! Each plugin owns one `SymbolResolver`. The supervisor writes to it on state
//! refresh and after live fetches; the round fan-out reads from it. All access
//! goes through one `RwLock`, so a refresh never tears a resolution.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use oracle_core::{
    CacheError, CachedObservation, PriceObservation, Symbol, SymbolNotation, UnixTimestamp,
};

/// Requested symbols classified against one plugin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Symbols to send, in the plugin's notation
    pub native: Vec<String>,
    /// Symbols the plugin cannot serve
    pub bad: Vec<Symbol>,
    pub native_to_canonical: HashMap<String, Symbol>,
}

#[derive(Debug, Default)]
struct ResolverInner {
    available: HashSet<String>,
    notation: Option<SymbolNotation>,
    /// Keyed by native symbol
    cache: HashMap<String, CachedObservation>,
}

/// Symbol notation, availability and cached prices for one plugin
#[derive(Debug)]
pub struct SymbolResolver {
    plugin: String,
    inner: RwLock<ResolverInner>,
}

impl SymbolResolver {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            inner: RwLock::new(ResolverInner::default()),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Replace the available set with what the plugin just reported.
    ///
    /// Cached prices for symbols that disappeared are dropped.
    pub fn refresh_available(&self, symbols: &[String]) {
        let mut inner = self.inner.write();
        inner.available = symbols.iter().cloned().collect();
        inner.notation = SymbolNotation::infer(symbols.iter().map(String::as_str));

        let ResolverInner { available, cache, .. } = &mut *inner;
        cache.retain(|native, _| available.contains(native));
    }

    pub fn available_count(&self) -> usize {
        self.inner.read().available.len()
    }

    /// Convert requested canonical symbols into the plugin's notation
    pub fn resolve(&self, requested: &[Symbol]) -> Resolution {
        let inner = self.inner.read();
        let mut resolution = Resolution::default();

        let Some(notation) = inner.notation else {
            resolution.bad = requested.to_vec();
            return resolution;
        };

        for symbol in requested {
            let native = notation
                .render(symbol)
                .filter(|n| inner.available.contains(n))
                .or_else(|| {
                    inner
                        .available
                        .contains(symbol.as_str())
                        .then(|| symbol.as_str().to_string())
                });

            match native {
                Some(native) if !resolution.native_to_canonical.contains_key(&native) => {
                    resolution.native.push(native.clone());
                    resolution.native_to_canonical.insert(native, symbol.clone());
                }
                _ => resolution.bad.push(symbol.clone()),
            }
        }

        resolution
    }

    /// Serve all requested symbols from cache, or none.
    ///
    /// Entries are only served strictly before their deadline.
    pub fn get_cached(
        &self,
        native: &[String],
        now: UnixTimestamp,
    ) -> Result<Vec<PriceObservation>, CacheError> {
        let inner = self.inner.read();
        if inner.notation.is_none() {
            return Err(CacheError::Unresolved);
        }

        native
            .iter()
            .map(|symbol| {
                let entry = inner
                    .cache
                    .get(symbol)
                    .ok_or_else(|| CacheError::Miss(symbol.clone()))?;
                if !entry.is_fresh(now) {
                    return Err(CacheError::Expired {
                        symbol: symbol.clone(),
                        deadline: entry.deadline,
                    });
                }
                Ok(entry.observation.clone())
            })
            .collect()
    }

    /// Store fresh observations keyed by native symbol
    pub fn update(
        &self,
        observations: impl IntoIterator<Item = (String, PriceObservation)>,
        update_interval_secs: u64,
    ) {
        let mut inner = self.inner.write();
        for (native, observation) in observations {
            inner
                .cache
                .insert(native, CachedObservation::new(observation, update_interval_secs));
        }
    }

    /// Unexpired cache entries, for diagnostics
    pub fn snapshot(&self, now: UnixTimestamp) -> Vec<CachedObservation> {
        self.inner
            .read()
            .cache
            .values()
            .filter(|c| c.is_fresh(now))
            .cloned()
            .collect()
    }
}
