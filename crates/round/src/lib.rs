//! Round engine for the oracle node
//!
//! Features:
//! - Median aggregation with a minimum-sources policy
//! - Explicit round state machine with pure transitions
//! - Parallel, deadline-bounded plugin fan-out
//! - Committee gating and previous-round audit

pub mod aggregator;
pub mod controller;
pub mod machine;

pub use aggregator::{median, AggregationPolicy, Aggregator, RoundAggregation};
pub use controller::{
    AuditOutcome, ControllerConfig, ControllerStatus, RoundController, SharedStatus, SymbolAudit,
};
pub use machine::{transition, InvalidTransition, PhaseEvent, RoundPhase};
