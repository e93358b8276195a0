//! Dynamically sized worker pool executing framed command lines.

pub mod framing;
mod manager;
mod worker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub use manager::WorkerPoolManager;
pub use worker::WorkerId;

use crate::network::ConnectionHandle;

/// Lines framed from one connection read, executed in order by one worker.
#[derive(Debug)]
pub struct Job {
    pub conn: Arc<ConnectionHandle>,
    pub lines: Vec<String>,
}

/// Pool occupancy as reported by `core.workers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers alive in the pool.
    pub active: usize,
    /// Workers waiting in the idle queue.
    pub idle: usize,
    /// Configured upper bound.
    pub max: usize,
}

/// Lock-free mirror of pool occupancy, updated by the manager under its
/// lock and read by anyone without it.
#[derive(Debug, Default)]
pub struct PoolGauge {
    active: AtomicUsize,
    idle: AtomicUsize,
}

impl PoolGauge {
    pub fn publish(&self, active: usize, idle: usize) {
        self.active.store(active, Ordering::Relaxed);
        self.idle.store(idle, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self, max: usize) -> PoolStats {
        PoolStats {
            active: self.active.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            max,
        }
    }
}
