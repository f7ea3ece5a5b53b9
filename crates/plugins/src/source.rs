//! Data-source capability
//!
//! A plugin is anything that answers `fetch_prices` and `state`. The
//! supervisor only sees this trait, so the transport behind it can be a
//! subprocess, a socket or an in-memory double.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use oracle_core::{PluginConfig, PluginResult};

use crate::protocol::{FetchPricesResult, StateResult};

/// Two-call contract every plugin implements
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch prices for symbols in the plugin's native notation
    async fn fetch_prices(&self, symbols: &[String]) -> PluginResult<FetchPricesResult>;

    /// Report version and available symbols
    async fn state(&self) -> PluginResult<StateResult>;

    /// Release the underlying channel
    async fn close(&self);

    fn is_alive(&self) -> bool;

    /// Version announced during the handshake
    fn version(&self) -> &str;
}

/// Everything needed to (re)start a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub path: PathBuf,
    pub config: PluginConfig,
    pub modified: Option<SystemTime>,
}

impl PluginSpec {
    pub fn new(config: PluginConfig, path: PathBuf) -> Self {
        Self {
            name: config.name.clone(),
            path,
            config,
            modified: None,
        }
    }
}

/// Starts a plugin and completes its handshake
#[async_trait::async_trait]
pub trait SourceLauncher: Send + Sync {
    async fn launch(&self, spec: &PluginSpec) -> PluginResult<Arc<dyn DataSource>>;
}
