//! JSON snapshot persistence and periodic autosave.
//!
//! A snapshot is assembled by the save hooks and written to a sibling
//! temporary file that is then renamed over the target, so a crash mid-write
//! never leaves a truncated snapshot behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context as _};
use stockd_core::Snapshot;
use tracing::{error, info};

use super::config::{DatabaseConfig, SharedTunables, Tunables};
use super::lifecycle::{HookRegistry, LifecycleHook};
use super::periodic::{PeriodicRunner, PeriodicTask};
use crate::context::ServerContext;

/// Error message reported when persistence is switched off.
pub const PERSISTENCE_DISABLED: &str = "database persistence is disabled";

/// Reads and writes the snapshot file named by the current tunables.
pub struct SnapshotPersistence {
    tunables: SharedTunables,
}

impl SnapshotPersistence {
    #[must_use]
    pub fn new(tunables: SharedTunables) -> Self {
        Self { tunables }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.tunables.load().database.persistence
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.tunables.load().database.file.clone()
    }

    /// Collects a snapshot from `hooks` and writes it atomically.
    ///
    /// # Errors
    ///
    /// Fails if persistence is disabled, any save hook fails, or the file
    /// cannot be written.
    pub fn save(&self, hooks: &HookRegistry) -> anyhow::Result<PathBuf> {
        if !self.is_enabled() {
            bail!(PERSISTENCE_DISABLED);
        }
        let path = self.path();

        let mut snapshot = Snapshot::default();
        hooks.save(&mut snapshot)?;
        let encoded = serde_json::to_vec_pretty(&snapshot).context("failed to encode snapshot")?;
        write_atomic(&path, &encoded)?;

        info!(path = %path.display(), products = snapshot.products.len(), "snapshot saved");
        Ok(path)
    }

    /// Reads the snapshot file and hands it to `hooks`.
    ///
    /// Returns `false` when persistence is disabled or the file does not
    /// exist yet.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or decoded, or a load hook fails.
    pub fn load(&self, hooks: &HookRegistry) -> anyhow::Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let path = self.path();
        if !path.exists() {
            info!(path = %path.display(), "no snapshot to load");
            return Ok(false);
        }

        let raw = fs::read(&path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to decode snapshot {}", path.display()))?;
        hooks.load(&snapshot)?;

        info!(path = %path.display(), products = snapshot.products.len(), "snapshot loaded");
        Ok(true)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Autosave
// ---------------------------------------------------------------------------

/// Periodic snapshot writer. Idles while persistence or autosave is off.
///
/// Holds the context weakly: the context owns the hook registry that in
/// turn owns the [`AutosaveService`] running this task.
pub struct Autosave {
    ctx: Weak<ServerContext>,
    tunables: SharedTunables,
}

impl Autosave {
    #[must_use]
    pub fn new(ctx: &Arc<ServerContext>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
            tunables: Arc::clone(&ctx.tunables),
        }
    }
}

impl PeriodicTask for Autosave {
    fn name(&self) -> &'static str {
        "autosave"
    }

    fn interval(&self) -> Duration {
        let interval = self.tunables.load().database.autosave_interval;
        if interval.is_zero() {
            Duration::from_secs(60)
        } else {
            interval
        }
    }

    fn on_tick(&mut self) {
        if !autosave_enabled(&self.tunables.load().database) {
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        if let Err(e) = ctx.save_snapshot() {
            error!(error = %format!("{e:#}"), "autosave failed");
        }
    }
}

fn autosave_enabled(db: &DatabaseConfig) -> bool {
    db.persistence && !db.autosave_interval.is_zero()
}

/// Runs [`Autosave`] while the database settings ask for it, and follows
/// them across reloads.
pub struct AutosaveService {
    runner: PeriodicRunner<Autosave>,
    tunables: SharedTunables,
}

impl AutosaveService {
    #[must_use]
    pub fn new(ctx: &Arc<ServerContext>) -> Self {
        Self {
            runner: PeriodicRunner::new(Autosave::new(ctx)),
            tunables: Arc::clone(&ctx.tunables),
        }
    }

    /// Starts the autosave thread if the current settings enable it.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn start(&self) -> std::io::Result<()> {
        let tunables = self.tunables.load();
        if autosave_enabled(&tunables.database) {
            self.runner.start()?;
            info!(interval_secs = tunables.database.autosave_interval.as_secs(), "autosave started");
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.runner.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }
}

impl LifecycleHook for AutosaveService {
    fn name(&self) -> &'static str {
        "autosave"
    }

    fn on_reload(&self, tunables: &Tunables) -> anyhow::Result<()> {
        let was_running = self.is_running();
        self.stop();
        if autosave_enabled(&tunables.database) {
            self.runner.start().context("failed to restart autosave")?;
        } else if was_running {
            info!("autosave stopped");
        }
        Ok(())
    }

    fn on_shutdown(&self) -> anyhow::Result<()> {
        self.stop();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
