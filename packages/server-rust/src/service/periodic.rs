//! Restartable background threads for periodic maintenance.
//!
//! A [`PeriodicRunner`] drives a [`PeriodicTask`] on its own OS thread. The
//! thread sleeps on a [`WakeSignal`] between ticks so `stop()` interrupts the
//! wait immediately instead of sitting out the rest of an interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

// ---------------------------------------------------------------------------
// PeriodicTask trait
// ---------------------------------------------------------------------------

/// Work executed by a [`PeriodicRunner`].
pub trait PeriodicTask: Send + 'static {
    /// Short name used for the thread name and log fields.
    fn name(&self) -> &'static str;

    /// Pause before the next tick. Re-read before every wait, so tasks that
    /// consult reloadable settings pick up changes without a restart.
    fn interval(&self) -> Duration;

    fn on_tick(&mut self);

    /// Whether to tick once before the first wait. Default is `false`.
    /// That tick runs even when the runner is stopped before its thread
    /// reaches it.
    fn tick_on_start(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// WakeSignal
// ---------------------------------------------------------------------------

/// A binary flag a sleeping thread can wait on with a timeout.
#[derive(Debug, Default)]
pub struct WakeSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.flag.lock() = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Blocks until the flag is set or `timeout` elapses. Returns whether
    /// the flag was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !*flag {
                    if self.cond.wait_until(&mut flag, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*flag {
                    self.cond.wait(&mut flag);
                }
            }
        }
        *flag
    }
}

// ---------------------------------------------------------------------------
// PeriodicRunner
// ---------------------------------------------------------------------------

/// Owns a [`PeriodicTask`] and the thread that ticks it.
///
/// `start` and `stop` are idempotent and may be called repeatedly; the task
/// value survives a stop so a later start resumes with the same state.
pub struct PeriodicRunner<T: PeriodicTask> {
    name: &'static str,
    task: Arc<Mutex<T>>,
    running: Arc<AtomicBool>,
    wake: Arc<WakeSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: PeriodicTask> PeriodicRunner<T> {
    #[must_use]
    pub fn new(task: T) -> Self {
        Self {
            name: task.name(),
            task: Arc::new(Mutex::new(task)),
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(WakeSignal::new()),
            thread: Mutex::new(None),
        }
    }

    /// Spawns the ticking thread unless it is already running.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn start(&self) -> std::io::Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let task = Arc::clone(&self.task);
        let running = Arc::clone(&self.running);
        let wake = Arc::clone(&self.wake);

        let spawned = thread::Builder::new()
            .name(format!("stockd-{}", self.name))
            .spawn(move || run_loop(&task, &running, &wake));

        match spawned {
            Ok(handle) => {
                *thread = Some(handle);
                info!(task = self.name, "periodic task started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Signals the thread, waits for it to exit, then re-arms the signal.
    pub fn stop(&self) {
        let mut thread = self.thread.lock();
        let Some(handle) = thread.take() else {
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        self.wake.set();
        if handle.join().is_err() {
            error!(task = self.name, "periodic task panicked");
        }
        self.wake.clear();
        info!(task = self.name, "periodic task stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Runs `f` against the task while holding its lock.
    pub fn with_task<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.task.lock())
    }
}

impl<T: PeriodicTask> Drop for PeriodicRunner<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop<T: PeriodicTask>(task: &Mutex<T>, running: &AtomicBool, wake: &WakeSignal) {
    let name = task.lock().name();

    if task.lock().tick_on_start() {
        task.lock().on_tick();
    }

    while running.load(Ordering::SeqCst) {
        let interval = task.lock().interval();
        wake.wait_timeout(interval);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        task.lock().on_tick();
    }

    debug!(task = name, "periodic loop exited");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
