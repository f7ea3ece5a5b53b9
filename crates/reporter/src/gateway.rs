//! Chain gateway contract
//!
//! Everything the round controller reads from or writes to the oracle
//! contract goes through this trait. Signing happens behind it.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use oracle_core::{ChainResult, RoundId, RoundWindow, Symbol};

use crate::builder::Report;

pub type TxHash = B256;

/// Inclusion state of a submitted report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Included { block: u64 },
    Failed,
}

/// A prior round's stored value for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundData {
    pub price: U256,
    pub timestamp: u64,
    pub status: u64,
}

impl RoundData {
    /// Status 0 is a successful report; every other code means missing or rejected
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait::async_trait]
pub trait ChainGateway: Send + Sync {
    /// Current round id and vote period
    async fn round_window(&self) -> ChainResult<RoundWindow>;

    async fn current_round(&self) -> ChainResult<RoundId> {
        Ok(self.round_window().await?.round_id)
    }

    /// Canonical symbols the contract expects reports for
    async fn symbols(&self) -> ChainResult<Vec<Symbol>>;

    async fn committee_members(&self) -> ChainResult<Vec<Address>>;

    async fn committee_size(&self) -> ChainResult<usize> {
        Ok(self.committee_members().await?.len())
    }

    /// Multiplier turning a decimal price into the contract's integer form
    async fn precision(&self) -> ChainResult<u64>;

    /// Sign and send a report. Fails with a retryable error on network or
    /// node trouble and with `Rejected` when the contract refuses it.
    async fn submit_report(&self, report: &Report) -> ChainResult<TxHash>;

    async fn transaction_status(&self, tx: &TxHash) -> ChainResult<TxStatus>;

    async fn round_data(&self, round: RoundId, symbol: &Symbol) -> ChainResult<RoundData>;

    /// Address of the signing key this gateway submits with
    fn node_address(&self) -> Address;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_data_status() {
        let ok = RoundData { price: U256::from(10_845_000u64), timestamp: 1, status: 0 };
        assert!(ok.is_success());
        assert!(!RoundData { status: 1, ..ok }.is_success());
        assert!(!RoundData { status: 255, ..ok }.is_success());
    }

    #[test]
    fn test_tx_status_wire_format() {
        let included: TxStatus = serde_json::from_str(r#"{"status":"included","block":42}"#).unwrap();
        assert_eq!(included, TxStatus::Included { block: 42 });
        let pending: TxStatus = serde_json::from_str(r#"{"status":"pending"}"#).unwrap();
        assert_eq!(pending, TxStatus::Pending);
    }
}
