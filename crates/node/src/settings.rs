//! Node configuration loading
//!
//! Layers, lowest first: built-in defaults, the config file, then
//! environment variables such as `ORACLE__ROUND__POLL_INTERVAL_MS`.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};

use oracle_core::NodeConfig;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "ORACLE_CONFIG";

/// Load `.env`, then the layered configuration
pub fn load() -> Result<NodeConfig> {
    dotenvy::dotenv().ok();
    let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    load_from(path.as_deref())
}

/// Load with an explicit config file, or `config/oracle.*` if present
pub fn load_from(path: Option<&Path>) -> Result<NodeConfig> {
    let defaults = Config::try_from(&NodeConfig::default()).context("Failed to encode defaults")?;

    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name("config/oracle").required(false),
    };

    let config: NodeConfig = Config::builder()
        .add_source(defaults)
        .add_source(file)
        .add_source(
            Environment::with_prefix("ORACLE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to parse configuration")?;

    config.validate()?;
    Ok(config)
}
