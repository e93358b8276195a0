//! Command execution and background services.
//!
//! 1. **Commands** (`command`, `builtin`): name lookup, arity checks and
//!    the built-in command table
//! 2. **Lifecycle** (`lifecycle`): save/load/reload/shutdown fan-out
//! 3. **Background tasks** (`periodic`, `expiration`, `persistence`):
//!    reservation expiry, snapshot autosave
//! 4. **Tunables** (`config`): reloadable settings shared by all of the above

pub mod builtin;
pub mod command;
pub mod config;
pub mod expiration;
pub mod lifecycle;
pub mod periodic;
pub mod persistence;

pub use command::{CommandError, CommandRegistry, CommandResult};
pub use config::{DatabaseConfig, SharedTunables, Tunables};
pub use expiration::ExpirationReaper;
pub use lifecycle::{HookRegistry, LifecycleHook};
pub use periodic::{PeriodicRunner, PeriodicTask, WakeSignal};
pub use persistence::SnapshotPersistence;
