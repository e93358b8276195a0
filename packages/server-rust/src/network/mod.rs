//! Networking: configuration, connection tracking, shutdown control and
//! the reactor.

pub mod config;
pub mod connection;
pub mod reactor;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use reactor::Server;
pub use shutdown::*;
