//! Error types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::{PluginState, Symbol, UnixTimestamp};

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("No plugins could be loaded from {0}")]
    NoPlugins(PathBuf),
}

/// Plugin-local failures. None of these escape the plugin's own round slot.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to spawn plugin {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("Handshake with plugin {name} failed: {reason}")]
    Handshake { name: String, reason: String },

    #[error("Plugin {name} timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("Plugin {0} channel closed")]
    ChannelClosed(String),

    #[error("Malformed response from plugin {name}: {reason}")]
    Malformed { name: String, reason: String },

    #[error("Plugin {name} returned error {code}: {message}")]
    Remote { name: String, code: i32, message: String },

    #[error("Plugin {name} is not live ({state})")]
    NotLive { name: String, state: PluginState },

    #[error("Plugin not found: {0}")]
    NotFound(String),
}

impl PluginError {
    /// Whether the transport itself is gone, as opposed to a slow or failing call
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PluginError::Spawn { .. }
                | PluginError::Handshake { .. }
                | PluginError::ChannelClosed(_)
                | PluginError::Malformed { .. }
        )
    }
}

/// Cache lookups fail as a whole so a round never mixes fetch epochs
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Plugin symbols are not resolved yet")]
    Unresolved,

    #[error("No cached observation for {0}")]
    Miss(String),

    #[error("Cached observation for {symbol} expired at {deadline}")]
    Expired { symbol: String, deadline: UnixTimestamp },
}

/// Chain gateway errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("Report rejected: {0}")]
    Rejected(String),

    #[error("Malformed gateway response: {0}")]
    Malformed(String),

    #[error("No round data for {symbol} in round {round}")]
    MissingRoundData { round: u64, symbol: Symbol },
}

impl ChainError {
    /// Network and node-level failures are retried; business rejections are not
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Network(_) | ChainError::Node { .. })
    }
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type PluginResult<T> = Result<T, PluginError>;
pub type ChainResult<T> = Result<T, ChainError>;
