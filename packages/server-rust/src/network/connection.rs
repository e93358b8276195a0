//! Connection handles and the registry of live connections.
//!
//! Each connection owns a bounded mpsc channel drained by its writer task.
//! Worker threads push response lines into it with [`ConnectionHandle::send_blocking`],
//! which gives per-connection backpressure without touching the socket
//! from outside the reactor. A client that stops reading for longer than
//! the send timeout is aborted rather than allowed to hold a worker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use super::config::ConnectionConfig;

/// Longest single wait between attempts while an outbound channel is full.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message queued for a connection's writer task.
#[derive(Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    /// One encoded response line, terminator included.
    Line(Vec<u8>),
    /// Flush what precedes this and close the write side.
    Close,
}

/// Error returned when a message cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The writer task is gone or the connection was deregistered.
    #[error("connection closed")]
    Disconnected,
    /// The channel is full, or stayed full for the whole send timeout.
    #[error("outbound channel full")]
    Full,
    /// The sender gave up while waiting for room.
    #[error("send cancelled")]
    Cancelled,
}

/// Handle to a single client connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    tx: mpsc::Sender<OutboundMessage>,
    live: AtomicBool,
    send_timeout: Duration,
    aborted: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// Queues a message without waiting.
    ///
    /// # Errors
    ///
    /// [`SendError::Full`] if the channel is at capacity,
    /// [`SendError::Disconnected`] if the writer has exited.
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), SendError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Queues a message from a worker thread, waiting at most the send
    /// timeout for room. While the channel is full, `park` is called with
    /// the time to wait before the next attempt; it returns `false` to
    /// give up.
    ///
    /// # Errors
    ///
    /// [`SendError::Disconnected`] if the connection was deregistered or its
    /// writer has exited, [`SendError::Full`] if the timeout ran out and
    /// [`SendError::Cancelled`] if `park` gave up.
    pub fn send_blocking(
        &self,
        msg: OutboundMessage,
        mut park: impl FnMut(Duration) -> bool,
    ) -> Result<(), SendError> {
        let deadline = Instant::now() + self.send_timeout;
        let mut msg = msg;
        loop {
            if !self.is_live() {
                return Err(SendError::Disconnected);
            }
            msg = match self.tx.try_send(msg) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(SendError::Disconnected),
                Err(mpsc::error::TrySendError::Full(msg)) => msg,
            };

            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(SendError::Full);
            }
            if !park(left.min(SEND_RETRY_INTERVAL)) {
                return Err(SendError::Cancelled);
            }
        }
    }

    /// `false` once the connection is deregistered or its writer exits.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Drops the connection without flushing queued responses. Its reader
    /// and writer tasks exit and the socket is closed.
    pub fn abort(&self) {
        self.mark_closed();
        self.aborted.send_replace(true);
    }

    /// Resolves once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        let mut rx = self.aborted.subscribe();
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    fn mark_closed(&self) {
        self.live.store(false, Ordering::Release);
    }
}

/// Thread-safe registry of all registered connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    ///
    /// Connection IDs start at 1 (0 is reserved as "no connection").
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection, returning its handle and the receiver the
    /// writer task drains.
    pub fn register(
        &self,
        peer: SocketAddr,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity.max(1));

        let handle = Arc::new(ConnectionHandle {
            id,
            peer,
            tx,
            live: AtomicBool::new(true),
            send_timeout: config.send_timeout,
            aborted: watch::channel(false).0,
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Deregisters a connection. Pending work for it is abandoned.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| {
            handle.mark_closed();
            handle
        })
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns all connections. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
