//! A single pool worker: one OS thread draining a private FIFO of jobs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use stockd_core::tokenize;
use tracing::{debug, error, trace, warn};

use super::manager::PoolShared;
use super::Job;
use crate::context::ServerContext;
use crate::network::{OutboundMessage, SendError};

pub type WorkerId = u64;

/// Worker thread plus the queue the manager feeds it through.
///
/// `pending` counts queued jobs plus the one executing, and is the load
/// figure used for least-loaded placement.
pub(crate) struct Worker {
    id: WorkerId,
    queue: Mutex<VecDeque<Job>>,
    ready: Condvar,
    pending: AtomicUsize,
    stopping: AtomicBool,
    idle: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawns the worker thread.
    pub(crate) fn spawn(id: WorkerId, shared: &Arc<PoolShared>) -> std::io::Result<Arc<Self>> {
        let worker = Arc::new(Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let this = Arc::clone(&worker);
        let shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("stockd-worker-{id}"))
            .spawn(move || this.run(&shared))?;
        *worker.thread.lock() = Some(handle);
        Ok(worker)
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Sets the idle flag, returning the previous value.
    pub(crate) fn set_idle(&self, idle: bool) -> bool {
        self.idle.swap(idle, Ordering::SeqCst)
    }

    pub(crate) fn add_job(&self, job: Job) {
        let mut queue = self.queue.lock();
        queue.push_back(job);
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.ready.notify_one();
    }

    /// Flags the worker to exit after its current line and drops its queue.
    /// A response send waiting on a full channel is woken and given up.
    /// Returns the number of jobs dropped.
    pub(crate) fn begin_stop(&self) -> usize {
        let mut queue = self.queue.lock();
        self.stopping.store(true, Ordering::SeqCst);
        let dropped = queue.len();
        queue.clear();
        self.pending.fetch_sub(dropped, Ordering::SeqCst);
        self.ready.notify_all();
        dropped
    }

    /// Waits for the thread to exit. A no-op from the worker's own thread.
    pub(crate) fn join(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(worker = self.id, "worker thread panicked");
        }
    }

    fn next_job(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        loop {
            if self.is_stopping() {
                return None;
            }
            if let Some(job) = queue.pop_front() {
                return Some(job);
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Sleeps for up to `wait` while a response send waits for room.
    /// Returns `false` once the worker is stopping.
    fn pause(&self, wait: Duration) -> bool {
        let mut queue = self.queue.lock();
        if !self.is_stopping() {
            self.ready.wait_for(&mut queue, wait);
        }
        !self.is_stopping()
    }

    fn run(self: Arc<Self>, shared: &PoolShared) {
        debug!(worker = self.id, "worker started");
        while let Some(job) = self.next_job() {
            let conn = job.conn.id;
            self.execute(job, &shared.ctx);
            self.pending.fetch_sub(1, Ordering::SeqCst);
            shared.job_finished(&self, conn);
        }
        debug!(worker = self.id, "worker exiting");
    }

    /// Runs each line and writes its response before starting the next.
    /// The rest of the job is abandoned once the connection goes away or
    /// the worker is told to stop. A client that leaves its responses
    /// unread past the send timeout is disconnected.
    fn execute(&self, job: Job, ctx: &ServerContext) {
        let total = job.lines.len();
        for (done, line) in job.lines.iter().enumerate() {
            if self.is_stopping() {
                debug!(worker = self.id, conn = %job.conn.id, dropped = total - done, "worker stopping, job abandoned");
                return;
            }
            if !job.conn.is_live() {
                debug!(worker = self.id, conn = %job.conn.id, dropped = total - done, "connection gone, job abandoned");
                return;
            }

            let tokens = tokenize(line);
            if tokens.is_empty() {
                continue;
            }
            let response = ctx.commands.invoke(ctx, &tokens);
            trace!(worker = self.id, conn = %job.conn.id, command = tokens[0], code = response.code, "command executed");

            let sent = job
                .conn
                .send_blocking(OutboundMessage::Line(response.to_line()), |wait| self.pause(wait));
            let dropped = total - done - 1;
            match sent {
                Ok(()) => {}
                Err(SendError::Full) => {
                    warn!(worker = self.id, conn = %job.conn.id, peer = %job.conn.peer, dropped, "client not reading responses, connection dropped");
                    job.conn.abort();
                    return;
                }
                Err(SendError::Cancelled) => {
                    debug!(worker = self.id, conn = %job.conn.id, dropped, "worker stopping, job abandoned");
                    return;
                }
                Err(e @ SendError::Disconnected) => {
                    debug!(worker = self.id, conn = %job.conn.id, error = %e, dropped, "connection gone, job abandoned");
                    return;
                }
            }
        }
    }
}
