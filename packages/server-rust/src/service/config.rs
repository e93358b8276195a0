//! Run-time tunables shared by every background component.
//!
//! Held in an [`ArcSwap`] so a configuration reload can publish a new set
//! atomically while workers, the reaper and the idle-worker sweep keep
//! reading whichever set was current when they looked.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

/// Tunables shared through [`SharedTunables`].
pub type SharedTunables = Arc<ArcSwap<Tunables>>;

/// Reloadable server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunables {
    /// Reservations untouched for longer than this are expired.
    pub ttl: Duration,
    /// Pause between two expiration passes.
    pub cleanup_interval: Duration,
    /// Upper bound on the worker pool size.
    pub max_workers: usize,
    /// Interval of the idle-worker sweep.
    pub scale_down_interval: Duration,
    /// A connection buffering more than this without a line separator is
    /// considered desynchronized and its buffer is discarded.
    pub max_line_bytes: usize,
    /// Snapshot persistence settings.
    pub database: DatabaseConfig,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(10),
            max_workers: 500,
            scale_down_interval: Duration::from_secs(30),
            max_line_bytes: 64 * 1024,
            database: DatabaseConfig::default(),
        }
    }
}

impl Tunables {
    /// Wraps these tunables for sharing.
    #[must_use]
    pub fn shared(self) -> SharedTunables {
        Arc::new(ArcSwap::from_pointee(self))
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub persistence: bool,
    pub file: PathBuf,
    /// Zero disables periodic saves.
    pub autosave_interval: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            persistence: false,
            file: PathBuf::from("/var/lib/stockd/stockd.json"),
            autosave_interval: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let tunables = Tunables::default();
        assert_eq!(tunables.ttl, Duration::from_secs(300));
        assert_eq!(tunables.cleanup_interval, Duration::from_secs(10));
        assert_eq!(tunables.max_workers, 500);
        assert!(!tunables.database.persistence);
        assert_eq!(tunables.database.autosave_interval, Duration::ZERO);
    }

    #[test]
    fn shared_tunables_swap_atomically() {
        let shared = Tunables::default().shared();
        let before = shared.load_full();

        shared.store(Arc::new(Tunables {
            max_workers: 3,
            ..Tunables::default()
        }));

        assert_eq!(before.max_workers, 500);
        assert_eq!(shared.load().max_workers, 3);
    }
}
