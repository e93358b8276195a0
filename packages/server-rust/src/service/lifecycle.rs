//! Lifecycle hooks fanned out to every registered component.
//!
//! Hooks run in registration order for save, load and reload, and in
//! reverse registration order for shutdown. A failing hook is logged and
//! the fan-out continues with the next one.

use std::sync::Arc;

use anyhow::bail;
use parking_lot::RwLock;
use stockd_core::{InventoryStore, Snapshot};
use tracing::{debug, error, warn};

use super::config::Tunables;

// ---------------------------------------------------------------------------
// LifecycleHook trait
// ---------------------------------------------------------------------------

/// A component that takes part in persistence, reload or shutdown.
///
/// Every method defaults to a no-op so implementors only override what they
/// care about.
pub trait LifecycleHook: Send + Sync {
    /// Unique name, used for logging and duplicate detection.
    fn name(&self) -> &'static str;

    /// Contributes this component's state to `snapshot`.
    fn on_save(&self, _snapshot: &mut Snapshot) -> anyhow::Result<()> {
        Ok(())
    }

    /// Repopulates this component from `snapshot`.
    fn on_load(&self, _snapshot: &Snapshot) -> anyhow::Result<()> {
        Ok(())
    }

    /// Applies freshly loaded tunables.
    fn on_reload(&self, _tunables: &Tunables) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

/// Ordered set of lifecycle hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn LifecycleHook>>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook. Returns `false` (and leaves the registry unchanged)
    /// if a hook with the same name is already registered.
    pub fn register(&self, hook: Arc<dyn LifecycleHook>) -> bool {
        let mut hooks = self.hooks.write();
        if hooks.iter().any(|h| h.name() == hook.name()) {
            warn!(hook = hook.name(), "lifecycle hook already registered");
            return false;
        }
        debug!(hook = hook.name(), "lifecycle hook registered");
        hooks.push(hook);
        true
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.read().iter().map(|h| h.name()).collect()
    }

    /// # Errors
    ///
    /// Returns an error naming how many hooks failed; the others still ran.
    pub fn save(&self, snapshot: &mut Snapshot) -> anyhow::Result<()> {
        let failed = self
            .ordered()
            .iter()
            .filter(|hook| report(hook.name(), "save", hook.on_save(snapshot)))
            .count();
        outcome("save", failed)
    }

    /// # Errors
    ///
    /// Returns an error naming how many hooks failed; the others still ran.
    pub fn load(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let failed = self
            .ordered()
            .iter()
            .filter(|hook| report(hook.name(), "load", hook.on_load(snapshot)))
            .count();
        outcome("load", failed)
    }

    /// # Errors
    ///
    /// Returns an error naming how many hooks failed; the others still ran.
    pub fn reload(&self, tunables: &Tunables) -> anyhow::Result<()> {
        let failed = self
            .ordered()
            .iter()
            .filter(|hook| report(hook.name(), "reload", hook.on_reload(tunables)))
            .count();
        outcome("reload", failed)
    }

    /// Runs shutdown hooks in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns an error naming how many hooks failed; the others still ran.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        let failed = self
            .ordered()
            .iter()
            .rev()
            .filter(|hook| report(hook.name(), "shutdown", hook.on_shutdown()))
            .count();
        outcome("shutdown", failed)
    }

    /// Copy of the hook list so no lock is held while hooks run.
    fn ordered(&self) -> Vec<Arc<dyn LifecycleHook>> {
        self.hooks.read().clone()
    }
}

/// Logs a hook failure. Returns `true` if the hook failed.
fn report(hook: &str, phase: &str, result: anyhow::Result<()>) -> bool {
    match result {
        Ok(()) => false,
        Err(e) => {
            error!(hook, phase, error = %format!("{e:#}"), "lifecycle hook failed");
            true
        }
    }
}

fn outcome(phase: &str, failed: usize) -> anyhow::Result<()> {
    if failed > 0 {
        bail!("{failed} lifecycle hook(s) failed during {phase}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// InventoryStore hook
// ---------------------------------------------------------------------------

impl LifecycleHook for InventoryStore {
    fn name(&self) -> &'static str {
        "inventory"
    }

    fn on_save(&self, snapshot: &mut Snapshot) -> anyhow::Result<()> {
        snapshot.products = self.snapshot();
        Ok(())
    }

    fn on_load(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.restore(&snapshot.products);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
