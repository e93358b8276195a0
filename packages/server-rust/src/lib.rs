//! `stockd` server: a line-protocol inventory and reservation service.
//!
//! A single-threaded reactor accepts connections and frames their input; a
//! dynamically sized pool of worker threads executes commands against a
//! per-SKU-locked [`InventoryStore`](stockd_core::InventoryStore); a
//! background reaper expires stale reservations.

pub mod config;
pub mod context;
pub mod network;
pub mod pool;
pub mod service;
pub mod telemetry;

pub use config::{CliArgs, ConfigSource, LogFormat, ServerConfig};
pub use context::ServerContext;
pub use network::Server;
pub use pool::{PoolStats, WorkerPoolManager};
