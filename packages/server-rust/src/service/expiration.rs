//! Background reaper for stale reservations.
//!
//! Every `cleanup_interval` the reaper walks a point-in-time copy of the SKU
//! set and expires each SKU independently under that SKU's own lock. A
//! failure on one SKU is logged and the pass moves on to the next.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use stockd_core::InventoryStore;
use tracing::{debug, error, info};

use super::config::{SharedTunables, Tunables};
use super::lifecycle::LifecycleHook;
use super::periodic::{PeriodicRunner, PeriodicTask};

/// One expiration pass over the whole store.
pub struct ExpirationSweep {
    store: Arc<InventoryStore>,
    tunables: SharedTunables,
}

impl ExpirationSweep {
    #[must_use]
    pub fn new(store: Arc<InventoryStore>, tunables: SharedTunables) -> Self {
        Self { store, tunables }
    }

    /// Expires every reservation older than the current TTL. Returns the
    /// number of reservations removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.tunables.load().ttl;
        let mut expired = 0;

        for sku in self.store.skus() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.store.expire_reservations(&sku, ttl)
            }));
            match outcome {
                Ok(Ok(removed)) => {
                    for reservation in &removed {
                        info!(
                            sku = %sku,
                            client_id = %reservation.client_id,
                            quantity = reservation.quantity,
                            "reservation expired"
                        );
                    }
                    expired += removed.len();
                }
                Ok(Err(e)) => debug!(sku = %sku, error = %e, "skipping sku"),
                Err(_) => error!(sku = %sku, "expiration failed for sku"),
            }
        }

        if expired > 0 {
            debug!(expired, "expiration pass finished");
        }
        expired
    }
}

impl PeriodicTask for ExpirationSweep {
    fn name(&self) -> &'static str {
        "expiration"
    }

    fn interval(&self) -> Duration {
        self.tunables.load().cleanup_interval
    }

    fn on_tick(&mut self) {
        self.sweep();
    }

    fn tick_on_start(&self) -> bool {
        true
    }
}

/// Owns the expiration thread.
pub struct ExpirationReaper {
    runner: PeriodicRunner<ExpirationSweep>,
}

impl ExpirationReaper {
    #[must_use]
    pub fn new(store: Arc<InventoryStore>, tunables: SharedTunables) -> Self {
        Self {
            runner: PeriodicRunner::new(ExpirationSweep::new(store, tunables)),
        }
    }

    /// Starts the reaper; a no-op if it is already running.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn start(&self) -> std::io::Result<()> {
        self.runner.start()
    }

    /// Stops the reaper and waits for an in-progress pass to finish.
    pub fn stop(&self) {
        self.runner.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    /// Runs one pass on the calling thread.
    pub fn sweep_now(&self) -> usize {
        self.runner.with_task(|sweep| sweep.sweep())
    }
}

impl LifecycleHook for ExpirationReaper {
    fn name(&self) -> &'static str {
        "expiration"
    }

    /// Restarts the thread so a shorter interval takes effect at once
    /// instead of after the wait already in progress.
    fn on_reload(&self, _tunables: &Tunables) -> anyhow::Result<()> {
        if self.is_running() {
            self.stop();
            self.start()?;
        }
        Ok(())
    }

    fn on_shutdown(&self) -> anyhow::Result<()> {
        self.stop();
        Ok(())
    }
}
