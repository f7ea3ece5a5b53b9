//! Plugin supervision for the oracle node
//!
//! Features:
//! - Plugin discovery and hot reload from a directory
//! - Subprocess transport with handshake and per-call timeouts
//! - Per-plugin symbol resolution and price cache
//! - Crash detection with bounded, backed-off restarts
//! - Plugin-side SDK for writing price plugins

pub mod discovery;
pub mod mock;
pub mod process;
pub mod protocol;
pub mod resolver;
pub mod sdk;
pub mod source;
pub mod supervisor;

pub use discovery::{discover_plugins, run_discovery};
pub use process::{ProcessLauncher, ProcessSource};
pub use resolver::{Resolution, SymbolResolver};
pub use source::{DataSource, PluginSpec, SourceLauncher};
pub use supervisor::{PluginFetch, PluginSupervisor, SupervisorConfig};
