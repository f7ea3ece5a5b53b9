//! Report submission to the oracle contract
//!
//! Features:
//! - Chain gateway contract and a JSON-RPC implementation
//! - Report building with on-chain precision scaling
//! - Deadline-bounded submission retries
//! - Inclusion tracking

pub mod builder;
pub mod gateway;
pub mod mock;
pub mod rpc;
pub mod submitter;

pub use builder::{Report, ReportBuilder, ReportEntry};
pub use gateway::{ChainGateway, RoundData, TxHash, TxStatus};
pub use rpc::RpcGateway;
pub use submitter::{Confirmation, ReportSubmitter, SubmitOutcome, SubmitterConfig};
