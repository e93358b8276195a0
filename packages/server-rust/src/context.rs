//! Shared server state handed to every command handler and background task.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use stockd_core::InventoryStore;
use tracing::info;

use crate::config::ConfigSource;
use crate::network::ShutdownController;
use crate::pool::PoolGauge;
use crate::service::command::CommandRegistry;
use crate::service::config::{SharedTunables, Tunables};
use crate::service::lifecycle::HookRegistry;
use crate::service::persistence::SnapshotPersistence;

/// Process-wide state shared by the reactor, the workers and the
/// background tasks.
///
/// Handlers receive `&ServerContext` at invocation time rather than
/// capturing it, so the context can own the command table without forming
/// a reference cycle.
pub struct ServerContext {
    pub store: Arc<InventoryStore>,
    pub commands: CommandRegistry<ServerContext>,
    pub hooks: HookRegistry,
    pub tunables: SharedTunables,
    pub shutdown: Arc<ShutdownController>,
    pub pool: PoolGauge,
    pub persistence: SnapshotPersistence,
    config_source: ConfigSource,
}

impl ServerContext {
    #[must_use]
    pub fn new(store: Arc<InventoryStore>, tunables: Tunables, config_source: ConfigSource) -> Self {
        let tunables = tunables.shared();
        Self {
            store,
            commands: CommandRegistry::new(),
            hooks: HookRegistry::new(),
            persistence: SnapshotPersistence::new(Arc::clone(&tunables)),
            tunables,
            shutdown: Arc::new(ShutdownController::new()),
            pool: PoolGauge::default(),
            config_source,
        }
    }

    /// Current tunables.
    #[must_use]
    pub fn tunables(&self) -> Arc<Tunables> {
        self.tunables.load_full()
    }

    /// Re-reads configuration, publishes the new tunables and fans out
    /// reload hooks.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if the configuration cannot be
    /// loaded; fails after publishing if any reload hook fails.
    pub fn reload(&self) -> anyhow::Result<()> {
        let config = self
            .config_source
            .load()
            .context("configuration reload failed")?;
        let tunables = Arc::new(config.tunables);
        self.tunables.store(Arc::clone(&tunables));
        info!(
            ttl_secs = tunables.ttl.as_secs(),
            cleanup_interval_secs = tunables.cleanup_interval.as_secs(),
            max_workers = tunables.max_workers,
            "configuration reloaded"
        );
        self.hooks.reload(&tunables)
    }

    /// Writes a snapshot of every save hook to the configured file.
    ///
    /// # Errors
    ///
    /// Fails if persistence is disabled, a save hook fails or the file
    /// cannot be written.
    pub fn save_snapshot(&self) -> anyhow::Result<PathBuf> {
        self.persistence.save(&self.hooks)
    }

    /// Loads the configured snapshot file into every load hook. Returns
    /// `false` if persistence is disabled or no file exists yet.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read, parsed or applied.
    pub fn load_snapshot(&self) -> anyhow::Result<bool> {
        self.persistence.load(&self.hooks)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::time::Duration;

    use super::*;
    use crate::config::CliArgs;

    #[test]
    fn reload_publishes_new_tunables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[general]\nworkers = 4\n[expiration]\nttl_secs = 9").unwrap();

        let source = ConfigSource {
            path: Some(file.path().to_path_buf()),
            overrides: CliArgs::default(),
        };
        let ctx = ServerContext::new(Arc::new(InventoryStore::new()), Tunables::default(), source);
        assert_eq!(ctx.tunables().max_workers, 500);

        ctx.reload().unwrap();

        assert_eq!(ctx.tunables().max_workers, 4);
        assert_eq!(ctx.tunables().ttl, Duration::from_secs(9));
    }

    #[test]
    fn failed_reload_keeps_previous_tunables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml = = =").unwrap();

        let source = ConfigSource {
            path: Some(file.path().to_path_buf()),
            overrides: CliArgs::default(),
        };
        let initial = Tunables {
            max_workers: 2,
            ..Tunables::default()
        };
        let ctx = ServerContext::new(Arc::new(InventoryStore::new()), initial, source);

        assert!(ctx.reload().is_err());
        assert_eq!(ctx.tunables().max_workers, 2);
    }
}
