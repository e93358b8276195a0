//! Network configuration types for the reactor.

use std::time::Duration;

/// Listen backlog used when the configured value is `<= 0`. The kernel
/// clamps it to its own maximum (`somaxconn` on Linux).
pub const OS_MAX_BACKLOG: u32 = i32::MAX as u32;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Listen backlog passed to `listen(2)`.
    pub backlog: u32,
    /// Per-connection settings.
    pub connection: ConnectionConfig,
    /// How long shutdown waits for connection writers to flush.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2000,
            backlog: OS_MAX_BACKLOG,
            connection: ConnectionConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Maps a configured backlog onto the value handed to `listen(2)`.
    #[must_use]
    pub fn backlog_from(configured: i32) -> u32 {
        u32::try_from(configured)
            .ok()
            .filter(|b| *b > 0)
            .unwrap_or(OS_MAX_BACKLOG)
    }
}

/// Per-connection configuration controlling buffering and backpressure.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc channel capacity for outbound response lines.
    pub outbound_channel_capacity: usize,
    /// Size of the buffer each socket read fills.
    pub read_buffer_size: usize,
    /// How long a worker waits for room in a full outbound channel before
    /// the client is considered stuck and the connection is dropped.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            read_buffer_size: 4096,
            send_timeout: Duration::from_secs(5),
        }
    }
}
