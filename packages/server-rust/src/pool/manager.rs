//! Worker pool manager: placement, growth and idle shrinking.
//!
//! Placement for a new job, in order:
//!
//! 1. the worker already holding unfinished work for the same connection,
//!    so one client's commands are answered in the order they were sent;
//! 2. the longest-idle worker;
//! 3. a freshly spawned worker, while the pool is below `max_workers`;
//! 4. the least-loaded worker, ties going to the oldest.
//!
//! Lock order is pool state, then a worker's queue. Threads are only ever
//! joined with the pool lock released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::framing::LineBuffer;
use super::worker::{Worker, WorkerId};
use super::{Job, PoolStats};
use crate::context::ServerContext;
use crate::network::{ConnectionHandle, ConnectionId};
use crate::service::periodic::{PeriodicRunner, PeriodicTask};

// ---------------------------------------------------------------------------
// Shared pool state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Affinity {
    worker: WorkerId,
    pending: usize,
}

#[derive(Default)]
struct PoolState {
    /// Every live worker, oldest first.
    workers: Vec<Arc<Worker>>,
    /// Workers with nothing to do, longest-idle first.
    idle: VecDeque<Arc<Worker>>,
    /// Connection -> worker holding its unfinished jobs.
    affinity: HashMap<ConnectionId, Affinity>,
}

/// State shared between the manager, its workers and the idle sweep.
pub(crate) struct PoolShared {
    pub(crate) ctx: Arc<ServerContext>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolShared {
    fn publish(&self, state: &PoolState) {
        self.ctx.pool.publish(state.workers.len(), state.idle.len());
    }

    /// Places `job`. Returns `false` if no worker could take it.
    fn assign(self: &Arc<Self>, job: Job) -> bool {
        let conn = job.conn.id;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let sticky = state
            .affinity
            .get(&conn)
            .and_then(|a| state.workers.iter().find(|w| w.id() == a.worker))
            .filter(|w| !w.is_stopping())
            .cloned();

        let worker = match sticky {
            Some(worker) => worker,
            None => match self.pick_worker(state) {
                Some(worker) => worker,
                None => {
                    drop(guard);
                    warn!(conn = %conn, lines = job.lines.len(), "no worker available, job dropped");
                    return false;
                }
            },
        };

        if worker.set_idle(false) {
            state.idle.retain(|w| w.id() != worker.id());
        }

        let entry = state.affinity.entry(conn).or_insert(Affinity {
            worker: worker.id(),
            pending: 0,
        });
        if entry.worker != worker.id() {
            *entry = Affinity {
                worker: worker.id(),
                pending: 0,
            };
        }
        entry.pending += 1;

        self.publish(state);
        worker.add_job(job);
        true
    }

    fn pick_worker(self: &Arc<Self>, state: &mut PoolState) -> Option<Arc<Worker>> {
        while let Some(worker) = state.idle.pop_front() {
            worker.set_idle(false);
            if !worker.is_stopping() {
                return Some(worker);
            }
        }

        let max = self.ctx.tunables().max_workers;
        if state.workers.len() < max {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match Worker::spawn(id, self) {
                Ok(worker) => {
                    state.workers.push(Arc::clone(&worker));
                    debug!(worker = id, pool_size = state.workers.len(), "worker spawned");
                    return Some(worker);
                }
                Err(e) => error!(error = %e, "failed to spawn worker"),
            }
        }

        // min_by_key keeps the first of equal elements, i.e. the oldest.
        state
            .workers
            .iter()
            .filter(|w| !w.is_stopping())
            .min_by_key(|w| w.pending_jobs())
            .cloned()
    }

    /// Bookkeeping after a worker finishes a job for `conn`.
    pub(crate) fn job_finished(&self, worker: &Arc<Worker>, conn: ConnectionId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(affinity) = state.affinity.get_mut(&conn) {
            if affinity.worker == worker.id() {
                affinity.pending = affinity.pending.saturating_sub(1);
                if affinity.pending == 0 {
                    state.affinity.remove(&conn);
                }
            }
        }

        if !worker.is_stopping() && worker.pending_jobs() == 0 && !worker.set_idle(true) {
            state.idle.push_back(Arc::clone(worker));
        }
        self.publish(state);
    }

    /// Stops every worker that is idle right now. Workers that picked up
    /// work since going idle are left running.
    fn reap_idle(&self) -> usize {
        let reaped: Vec<Arc<Worker>> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut reaped = Vec::new();
            for worker in std::mem::take(&mut state.idle) {
                worker.set_idle(false);
                if worker.pending_jobs() > 0 {
                    continue;
                }
                worker.begin_stop();
                state.workers.retain(|w| w.id() != worker.id());
                reaped.push(worker);
            }
            self.publish(state);
            reaped
        };

        for worker in &reaped {
            worker.join();
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "idle workers stopped");
        }
        reaped.len()
    }
}

// ---------------------------------------------------------------------------
// Idle sweep
// ---------------------------------------------------------------------------

struct IdleSweep {
    shared: Arc<PoolShared>,
}

impl PeriodicTask for IdleSweep {
    fn name(&self) -> &'static str {
        "pool-scaledown"
    }

    fn interval(&self) -> Duration {
        self.shared.ctx.tunables().scale_down_interval
    }

    fn on_tick(&mut self) {
        self.shared.reap_idle();
    }
}

// ---------------------------------------------------------------------------
// WorkerPoolManager
// ---------------------------------------------------------------------------

/// Frames connection input into jobs and hands them to pool workers.
pub struct WorkerPoolManager {
    shared: Arc<PoolShared>,
    buffers: DashMap<ConnectionId, LineBuffer>,
    accepting: AtomicBool,
    idle_sweep: PeriodicRunner<IdleSweep>,
}

impl WorkerPoolManager {
    /// Creates an empty pool. No thread is started until [`start`](Self::start).
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let shared = Arc::new(PoolShared {
            ctx,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
        });
        Self {
            idle_sweep: PeriodicRunner::new(IdleSweep {
                shared: Arc::clone(&shared),
            }),
            shared,
            buffers: DashMap::new(),
            accepting: AtomicBool::new(false),
        }
    }

    /// Starts accepting jobs and the idle sweep.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the sweep thread cannot be spawned.
    pub fn start(&self) -> std::io::Result<()> {
        self.idle_sweep.start()?;
        self.accepting.store(true, Ordering::SeqCst);
        info!(max_workers = self.shared.ctx.tunables().max_workers, "worker pool started");
        Ok(())
    }

    /// Feeds bytes read from `conn`. Complete lines become one job.
    ///
    /// Empty input means the peer closed: the connection's buffered partial
    /// line is forgotten and `false` is returned. Otherwise returns `true`,
    /// even when the lines could not be placed.
    pub fn dispatch(&self, conn: &Arc<ConnectionHandle>, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            self.forget(conn.id);
            return false;
        }

        let max_line_bytes = self.shared.ctx.tunables().max_line_bytes;
        let framed = self
            .buffers
            .entry(conn.id)
            .or_default()
            .push(bytes, max_line_bytes);

        if framed.discarded > 0 {
            warn!(conn = %conn.id, bytes = framed.discarded, "line too long, input discarded");
        }
        if framed.lines.is_empty() {
            return true;
        }
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(conn = %conn.id, lines = framed.lines.len(), "pool not accepting, job dropped");
            return true;
        }

        self.shared.assign(Job {
            conn: Arc::clone(conn),
            lines: framed.lines,
        });
        true
    }

    /// Drops the framing state of a connection.
    pub fn forget(&self, conn: ConnectionId) {
        self.buffers.remove(&conn);
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            active: state.workers.len(),
            idle: state.idle.len(),
            max: self.shared.ctx.tunables().max_workers,
        }
    }

    /// Stops every idle worker now instead of waiting for the sweep.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// Stops the idle sweep and every worker, dropping queued jobs. Blocks
    /// until all worker threads have exited. Idempotent.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.idle_sweep.stop();

        let workers: Vec<Arc<Worker>> = {
            let mut state = self.shared.state.lock();
            state.idle.clear();
            state.affinity.clear();
            let workers: Vec<Arc<Worker>> = state.workers.drain(..).collect();
            self.shared.publish(&state);
            workers
        };

        let dropped: usize = workers
            .iter()
            .map(|w| {
                w.set_idle(false);
                w.begin_stop()
            })
            .sum();
        for worker in &workers {
            worker.join();
        }
        self.buffers.clear();

        if !workers.is_empty() {
            info!(workers = workers.len(), dropped_jobs = dropped, "worker pool stopped");
        }
    }
}

impl Drop for WorkerPoolManager {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
