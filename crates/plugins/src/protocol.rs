//! Plugin wire protocol
//!
//! Newline-delimited JSON-RPC 2.0 over the plugin's stdin/stdout. Stdout is
//! reserved for responses; plugins log to stderr.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAGIC_COOKIE_KEY: &str = "ORACLE_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "d1a6c3e0-price-source-v1";
pub const PLUGIN_CONF_ENV: &str = "ORACLE_PLUGIN_CONF";

pub mod methods {
    pub const HANDSHAKE: &str = "handshake";
    pub const FETCH_PRICES: &str = "fetch_prices";
    pub const STATE: &str = "state";
    pub const SHUTDOWN: &str = "shutdown";
}

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn parse_error() -> Self {
        Self { code: -32700, message: "PARSE_ERROR".to_string() }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self { code: -32601, message: format!("METHOD_NOT_FOUND: {method}") }
    }

    pub fn invalid_params(detail: &str) -> Self {
        Self { code: -32602, message: format!("INVALID_PARAMS: {detail}") }
    }

    pub fn internal_error(detail: &str) -> Self {
        Self { code: -32603, message: format!("INTERNAL_ERROR: {detail}") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    pub protocol_version: u32,
    pub magic_cookie: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResult {
    pub protocol_version: u32,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPricesParams {
    pub symbols: Vec<String>,
}

/// Price in the plugin's native symbol notation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePrice {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPricesResult {
    #[serde(default)]
    pub prices: Vec<WirePrice>,
    #[serde(default)]
    pub bad_symbols: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResult {
    pub version: String,
    #[serde(default)]
    pub available_symbols: Vec<String>,
}
