//! JSON-RPC chain gateway
//!
//! Talks to a signing node that exposes the oracle contract over HTTP
//! JSON-RPC. The node holds the key for `node_address` and signs reports.

use alloy_primitives::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use oracle_core::{ChainError, ChainResult, GatewayConfig, RoundId, RoundWindow, Symbol};

use crate::builder::Report;
use crate::gateway::{ChainGateway, RoundData, TxHash, TxStatus};

/// JSON-RPC code the node uses for a reverted contract call
const EXECUTION_REVERTED: i64 = 3;

pub mod methods {
    pub const ROUND_WINDOW: &str = "oracle_roundWindow";
    pub const SYMBOLS: &str = "oracle_symbols";
    pub const COMMITTEE: &str = "oracle_committee";
    pub const PRECISION: &str = "oracle_precision";
    pub const SUBMIT_REPORT: &str = "oracle_submitReport";
    pub const TX_STATUS: &str = "oracle_txStatus";
    pub const ROUND_DATA: &str = "oracle_roundData";
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct SubmitParams<'a> {
    from: Address,
    report: &'a Report,
}

/// Chain gateway over HTTP JSON-RPC
pub struct RpcGateway {
    client: reqwest::Client,
    url: String,
    node_address: Address,
    next_id: AtomicU64,
}

impl RpcGateway {
    pub fn new(config: &GatewayConfig) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ChainError::Network(e.to_string()))?;

        Ok(Self {
            client,
            url: config.rpc_url.clone(),
            node_address: config.node_address,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> ChainResult<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChainError::Network(format!("{} returned {}", method, response.status())));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("{method}: {e}")))?;

        if let Some(error) = body.error {
            debug!(method, code = error.code, "Gateway call failed: {}", error.message);
            return Err(if error.code == EXECUTION_REVERTED {
                ChainError::Rejected(error.message)
            } else {
                ChainError::Node {
                    code: error.code,
                    message: error.message,
                }
            });
        }

        let result = body
            .result
            .ok_or_else(|| ChainError::Malformed(format!("{method}: empty result")))?;
        serde_json::from_value(result).map_err(|e| ChainError::Malformed(format!("{method}: {e}")))
    }
}

#[async_trait::async_trait]
impl ChainGateway for RpcGateway {
    async fn round_window(&self) -> ChainResult<RoundWindow> {
        self.call(methods::ROUND_WINDOW, ()).await
    }

    async fn symbols(&self) -> ChainResult<Vec<Symbol>> {
        self.call(methods::SYMBOLS, ()).await
    }

    async fn committee_members(&self) -> ChainResult<Vec<Address>> {
        self.call(methods::COMMITTEE, ()).await
    }

    async fn precision(&self) -> ChainResult<u64> {
        self.call(methods::PRECISION, ()).await
    }

    async fn submit_report(&self, report: &Report) -> ChainResult<TxHash> {
        let params = SubmitParams {
            from: self.node_address,
            report,
        };
        self.call(methods::SUBMIT_REPORT, [params]).await
    }

    async fn transaction_status(&self, tx: &TxHash) -> ChainResult<TxStatus> {
        self.call(methods::TX_STATUS, [tx]).await
    }

    async fn round_data(&self, round: RoundId, symbol: &Symbol) -> ChainResult<RoundData> {
        self.call(methods::ROUND_DATA, (round, symbol)).await
    }

    fn node_address(&self) -> Address {
        self.node_address
    }
}
