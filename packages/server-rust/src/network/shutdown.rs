//! Server lifecycle state and shutdown signalling.
//!
//! The state lives in an `ArcSwap` so any thread (workers answering
//! `core.shutdown`, the signal task, the reactor) can read or advance it
//! without locking. Connection writers hold an [`InFlightGuard`] so teardown
//! can wait for buffered responses to reach the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Server lifecycle state.
///
/// State machine: Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Listener not yet bound.
    Starting,
    /// Accepting connections and dispatching work.
    Running,
    /// Shutdown requested; no new connections are accepted.
    Stopping,
    /// Every component has been torn down.
    Stopped,
}

/// Coordinates shutdown between the reactor, its connection tasks and any
/// thread that asks the server to stop.
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<ServerState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(ServerState::Starting),
        }
    }

    pub fn set_running(&self) {
        self.state.store(Arc::new(ServerState::Running));
    }

    /// Returns a receiver that flips to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Requests shutdown. Safe to call from any thread, any number of times.
    pub fn trigger_shutdown(&self) {
        if self.state() != ServerState::Stopped {
            self.state.store(Arc::new(ServerState::Stopping));
        }
        self.shutdown_signal.send_replace(true);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        **self.state.load()
    }

    /// Creates an RAII guard counted until dropped, even on panic.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for every guard to be dropped, up to `timeout`.
    ///
    /// Transitions to `Stopped` either way and returns whether the drain
    /// completed before the deadline.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        let drained = loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                break true;
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        self.state.store(Arc::new(ServerState::Stopped));
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_starting() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), ServerState::Starting);
        assert_eq!(controller.in_flight_count(), 0);
        assert!(!controller.is_triggered());
    }

    #[test]
    fn state_transitions_starting_running_stopping() {
        let controller = ShutdownController::new();
        controller.set_running();
        assert_eq!(controller.state(), ServerState::Running);

        controller.trigger_shutdown();
        assert_eq!(controller.state(), ServerState::Stopping);
        assert!(controller.is_triggered());
    }

    #[test]
    fn trigger_is_idempotent() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.trigger_shutdown();
        assert_eq!(controller.state(), ServerState::Stopping);
    }

    #[test]
    fn in_flight_guard_increments_and_decrements() {
        let controller = ShutdownController::new();

        let guard1 = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard1);
        assert_eq!(controller.in_flight_count(), 1);
        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_for_drain_with_active_writers() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), ServerState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_drain_timeout_still_stops() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(controller.state(), ServerState::Stopped);
    }
}
