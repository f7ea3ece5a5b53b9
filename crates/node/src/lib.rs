//! Oracle node
//!
//! Wires plugin supervision, round control and the diagnostics endpoint
//! into one process.

pub mod error;
pub mod server;
pub mod service;
pub mod settings;

pub use error::DiagnosticsError;
pub use server::{DiagnosticsServer, DiagnosticsServerBuilder, DiagnosticsServerConfig};
pub use service::{OracleService, VERSION};
