//! Configuration types

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::CoreError;

/// Per-plugin settings, handed to the plugin process as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,
    pub key: String,
    pub scheme: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Freshness window of this plugin's observations
    pub data_update_interval_secs: u64,
    pub disabled: bool,
}

impl PluginConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            key: String::new(),
            scheme: "https".to_string(),
            endpoint: String::new(),
            timeout_secs: 10,
            data_update_interval_secs: 60,
            disabled: false,
        }
    }
}

/// Chain gateway endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub rpc_url: String,
    pub request_timeout_ms: u64,
    /// Address whose signing capability the gateway holds
    pub node_address: Address,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8645".to_string(),
            request_timeout_ms: 5_000,
            node_address: Address::ZERO,
        }
    }
}

/// Plugin supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub handshake_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub state_refresh_interval_secs: u64,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
    pub max_restart_attempts: u32,
    pub max_consecutive_failures: u32,
    /// 0 disables directory rescans
    pub discovery_interval_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            call_timeout_ms: 10_000,
            state_refresh_interval_secs: 30,
            restart_backoff_initial_ms: 1_000,
            restart_backoff_max_ms: 60_000,
            max_restart_attempts: 10,
            max_consecutive_failures: 3,
            discovery_interval_secs: 10,
        }
    }
}

/// Round controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundSettings {
    pub poll_interval_ms: u64,
    /// Upper bound for the whole fan-out
    pub fetch_timeout_ms: u64,
    pub submit_retry_initial_ms: u64,
    pub submit_retry_max_ms: u64,
    /// Submission is abandoned once the next boundary is this close
    pub submit_guard_secs: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_interval_ms: u64,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            fetch_timeout_ms: 12_000,
            submit_retry_initial_ms: 500,
            submit_retry_max_ms: 8_000,
            submit_guard_secs: 5,
            confirm_timeout_ms: 30_000,
            confirm_poll_interval_ms: 1_000,
        }
    }
}

/// Aggregation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub min_sources: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self { min_sources: 1 }
    }
}

/// Diagnostics endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub plugin_dir: PathBuf,
    pub plugins: Vec<PluginConfig>,
    pub gateway: GatewayConfig,
    pub supervisor: SupervisorSettings,
    pub round: RoundSettings,
    pub aggregation: AggregationSettings,
    pub diagnostics: DiagnosticsSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            plugins: vec![],
            gateway: GatewayConfig::default(),
            supervisor: SupervisorSettings::default(),
            round: RoundSettings::default(),
            aggregation: AggregationSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
        }
    }
}

impl NodeConfig {
    /// Settings for a plugin binary, falling back to defaults
    pub fn plugin_config(&self, name: &str) -> PluginConfig {
        self.plugins
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .unwrap_or_else(|| PluginConfig::named(name))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.aggregation.min_sources == 0 {
            return Err(CoreError::InvalidConfig(
                "aggregation.min_sources must be at least 1".into(),
            ));
        }
        if self.gateway.rpc_url.trim().is_empty() {
            return Err(CoreError::InvalidConfig("gateway.rpc_url is empty".into()));
        }
        let zero_timeouts = [
            ("supervisor.handshake_timeout_ms", self.supervisor.handshake_timeout_ms),
            ("supervisor.call_timeout_ms", self.supervisor.call_timeout_ms),
            ("round.poll_interval_ms", self.round.poll_interval_ms),
            ("round.fetch_timeout_ms", self.round.fetch_timeout_ms),
            ("gateway.request_timeout_ms", self.gateway.request_timeout_ms),
        ];
        if let Some((field, _)) = zero_timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(CoreError::InvalidConfig(format!("{field} must be positive")));
        }
        if self.round.fetch_timeout_ms < self.supervisor.call_timeout_ms {
            return Err(CoreError::InvalidConfig(
                "round.fetch_timeout_ms must not be shorter than supervisor.call_timeout_ms".into(),
            ));
        }
        if let Some(p) = self.plugins.iter().find(|p| p.name.is_empty()) {
            return Err(CoreError::InvalidConfig(format!("plugin entry without a name: {p:?}")));
        }
        Ok(())
    }
}
