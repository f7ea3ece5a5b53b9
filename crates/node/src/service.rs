//! Read-only diagnostics service
//!
//! Answers queries about the node from supervisor and controller
//! snapshots. Nothing here can change node state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use oracle_core::{PluginInfo, PriceObservation, Symbol};
use oracle_plugins::PluginSupervisor;
use oracle_round::{median, ControllerStatus, SharedStatus};

use crate::error::DiagnosticsError;

pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

pub mod methods {
    pub const GET_VERSION: &str = "get_version";
    pub const LIST_PLUGINS: &str = "list_plugins";
    pub const GET_PRICES: &str = "get_prices";
    pub const GET_ROUND_STATUS: &str = "get_round_status";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

/// Cached view of one symbol across plugins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolPrices {
    pub median: Decimal,
    pub sources: usize,
    pub observations: Vec<PriceObservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub prices: BTreeMap<Symbol, SymbolPrices>,
    pub symbols: Vec<Symbol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub plugins: usize,
    pub live_plugins: usize,
}

/// Diagnostics queries over shared node state
#[derive(Clone)]
pub struct OracleService {
    supervisor: Arc<PluginSupervisor>,
    status: SharedStatus,
    start_time: Instant,
}

impl OracleService {
    pub fn new(supervisor: Arc<PluginSupervisor>, status: SharedStatus) -> Self {
        Self {
            supervisor,
            status,
            start_time: Instant::now(),
        }
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            version: VERSION.to_string(),
        }
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.supervisor.snapshot()
    }

    pub fn prices(&self) -> PriceSnapshot {
        let prices = self
            .supervisor
            .cached_prices()
            .into_iter()
            .filter_map(|(symbol, observations)| {
                let mut values: Vec<Decimal> = observations.iter().map(|o| o.price).collect();
                let median = median(&mut values)?;
                Some((
                    symbol,
                    SymbolPrices {
                        median,
                        sources: observations.len(),
                        observations,
                    },
                ))
            })
            .collect();

        PriceSnapshot {
            prices,
            symbols: self.status.read().tracked_symbols.clone(),
        }
    }

    pub fn round_status(&self) -> ControllerStatus {
        self.status.read().clone()
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok".to_string(),
            version: VERSION.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            plugins: self.supervisor.plugin_count(),
            live_plugins: self.supervisor.live_plugins().len(),
        }
    }

    /// Answer one diagnostics method
    pub fn dispatch(&self, method: &str) -> Result<serde_json::Value, DiagnosticsError> {
        let encoded = match method {
            methods::GET_VERSION => serde_json::to_value(self.version()),
            methods::LIST_PLUGINS => serde_json::to_value(self.plugins()),
            methods::GET_PRICES => serde_json::to_value(self.prices()),
            methods::GET_ROUND_STATUS => serde_json::to_value(self.round_status()),
            other => return Err(DiagnosticsError::UnknownMethod(other.to_string())),
        };
        encoded.map_err(|e| DiagnosticsError::Internal(e.to_string()))
    }
}
