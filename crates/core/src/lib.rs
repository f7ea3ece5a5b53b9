//! Core types and utilities for the oracle node
//!
//! This crate provides shared types used across all components:
//! - Symbols and their per-plugin notations
//! - Price observations, cache entries and aggregated round prices
//! - Round windows and plugin lifecycle states
//! - Node configuration and the error taxonomy

pub mod types;
pub mod symbols;
pub mod config;
pub mod errors;

pub use types::*;
pub use symbols::*;
pub use config::*;
pub use errors::*;
