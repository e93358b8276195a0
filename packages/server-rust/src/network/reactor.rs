//! The I/O reactor: one thread multiplexing the listener and every client
//! socket.
//!
//! Follows the deferred startup pattern:
//! 1. `new()` allocates shared state and registers commands and hooks
//! 2. `start()` loads any snapshot and binds the listener
//! 3. `serve()` starts the pool and reaper and accepts until shutdown
//!
//! The reactor never executes commands. Each connection gets a reader task
//! that feeds raw bytes to the [`WorkerPoolManager`] and a writer task that
//! drains responses the workers queue on the connection's channel.

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use stockd_core::InventoryStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionHandle, ConnectionRegistry, OutboundMessage, SendError};
use super::shutdown::InFlightGuard;
use crate::config::{ConfigSource, ServerConfig};
use crate::context::ServerContext;
use crate::pool::WorkerPoolManager;
use crate::service::builtin::register_builtin;
use crate::service::expiration::ExpirationReaper;
use crate::service::persistence::AutosaveService;

/// Pause after an accept error that is not specific to one connection
/// (e.g. descriptor exhaustion) before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The server: reactor, worker pool, reaper and persistence wired together.
pub struct Server {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    ctx: Arc<ServerContext>,
    manager: Arc<WorkerPoolManager>,
    reaper: Arc<ExpirationReaper>,
    autosave: Arc<AutosaveService>,
}

impl Server {
    /// Creates a server over an empty store. Nothing is bound or spawned.
    #[must_use]
    pub fn new(config: ServerConfig, source: ConfigSource) -> Self {
        Self::with_store(config, source, Arc::new(InventoryStore::new()))
    }

    #[must_use]
    pub fn with_store(config: ServerConfig, source: ConfigSource, store: Arc<InventoryStore>) -> Self {
        let ctx = Arc::new(ServerContext::new(store, config.tunables, source));
        register_builtin(&ctx.commands);

        let reaper = Arc::new(ExpirationReaper::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.tunables),
        ));
        let autosave = Arc::new(AutosaveService::new(&ctx));
        ctx.hooks.register(ctx.store.clone());
        ctx.hooks.register(reaper.clone());
        ctx.hooks.register(autosave.clone());

        Self {
            config: config.network,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            manager: Arc::new(WorkerPoolManager::new(Arc::clone(&ctx))),
            autosave,
            reaper,
            ctx,
        }
    }

    #[must_use]
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Loads the snapshot (if persistence is on) and binds the listener.
    ///
    /// Returns the bound address, whose port differs from the configured
    /// one when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be resolved or bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        if let Err(e) = self.ctx.load_snapshot() {
            error!(error = %format!("{e:#}"), "snapshot load failed, starting empty");
        }

        let addr = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| format!("cannot resolve {}:{}", self.config.host, self.config.port))?
            .next()
            .with_context(|| format!("no address for {}", self.config.host))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("cannot bind {addr}"))?;
        let listener = socket.listen(self.config.backlog)?;
        let local = listener.local_addr()?;

        info!(addr = %local, backlog = self.config.backlog, "listener bound");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Runs until `shutdown` completes or a shutdown is triggered through
    /// the controller (e.g. by `core.shutdown`), then tears everything down.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or a background
    /// component cannot be started.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;

        if let Err(e) = self.start_components() {
            drop(listener);
            self.stop().await;
            return Err(e);
        }
        self.ctx.shutdown.set_running();
        info!("server running");

        let mut shutdown_rx = self.ctx.shutdown.shutdown_receiver();
        tokio::pin!(shutdown);

        while !self.ctx.shutdown.is_triggered() {
            tokio::select! {
                () = &mut shutdown => break,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "accept aborted by peer");
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        self.stop().await;
        Ok(())
    }

    /// Builds a single-threaded runtime, serves until SIGINT or SIGTERM,
    /// and reloads configuration on SIGUSR1.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or the server fails
    /// to start.
    pub fn run(mut self) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build reactor runtime")?;

        runtime.block_on(async move {
            let addr = self.start().await?;
            info!(%addr, "stockd listening");
            let signals = os_signals(Arc::clone(&self.ctx));
            self.serve(signals).await
        })
    }

    fn start_components(&self) -> anyhow::Result<()> {
        self.manager.start().context("failed to start worker pool")?;
        self.reaper
            .start()
            .context("failed to start expiration reaper")?;
        self.autosave.start().context("failed to start autosave")?;
        Ok(())
    }

    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let (handle, rx) = self.registry.register(peer, &self.config.connection);
        debug!(conn = %handle.id, %peer, "connection accepted");

        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(
            writer,
            Arc::clone(&handle),
            rx,
            self.ctx.shutdown.in_flight_guard(),
        ));
        tokio::spawn(read_loop(
            reader,
            handle,
            Arc::clone(&self.manager),
            Arc::clone(&self.registry),
            self.ctx.shutdown.shutdown_receiver(),
            self.config.connection.read_buffer_size,
        ));
    }

    /// Teardown, in order: worker pool, shutdown hooks (autosave, then the
    /// reaper) and a final snapshot; then every connection is closed once
    /// its queued responses are written.
    async fn stop(self) {
        let ctx = Arc::clone(&self.ctx);
        let drain_timeout = self.config.drain_timeout;
        ctx.shutdown.trigger_shutdown();
        info!(connections = self.registry.count(), "shutting down");

        let manager = Arc::clone(&self.manager);
        let blocking_ctx = Arc::clone(&ctx);

        // Joining worker threads blocks; workers in turn may be waiting on a
        // full connection channel that only this runtime drains.
        let teardown = tokio::task::spawn_blocking(move || {
            manager.stop();
            if let Err(e) = blocking_ctx.hooks.shutdown() {
                error!(error = %format!("{e:#}"), "shutdown hooks failed");
            }
            if blocking_ctx.persistence.is_enabled() {
                if let Err(e) = blocking_ctx.save_snapshot() {
                    error!(error = %format!("{e:#}"), "final snapshot failed");
                }
            }
        });
        if let Err(e) = teardown.await {
            error!(error = %e, "teardown task failed");
        }

        for handle in self.registry.drain_all() {
            if handle.try_send(OutboundMessage::Close) == Err(SendError::Full) {
                debug!(conn = %handle.id, "outbound queue full at shutdown, connection aborted");
                handle.abort();
            }
        }
        drop(self);

        if ctx.shutdown.wait_for_drain(drain_timeout).await {
            info!("server stopped");
        } else {
            warn!("server stopped with unflushed connections");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn read_loop(
    mut reader: OwnedReadHalf,
    handle: Arc<ConnectionHandle>,
    manager: Arc<WorkerPoolManager>,
    registry: Arc<ConnectionRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            () = handle.aborted() => {
                manager.forget(handle.id);
                break;
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(n) => {
                if !manager.dispatch(&handle, &buf[..n]) {
                    debug!(conn = %handle.id, "peer closed connection");
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(e) => {
                debug!(conn = %handle.id, error = %e, "connection error");
                manager.forget(handle.id);
                break;
            }
        }
    }

    registry.remove(handle.id);
    if handle.try_send(OutboundMessage::Close) == Err(SendError::Full) {
        handle.abort();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    handle: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    _guard: InFlightGuard,
) {
    loop {
        let msg = tokio::select! {
            biased;
            () = handle.aborted() => return,
            msg = rx.recv() => msg,
        };
        match msg {
            Some(OutboundMessage::Line(bytes)) => {
                let written = tokio::select! {
                    biased;
                    () = handle.aborted() => return,
                    written = writer.write_all(&bytes) => written,
                };
                if let Err(e) = written {
                    debug!(conn = %handle.id, error = %e, "write failed, dropping connection output");
                    break;
                }
            }
            Some(OutboundMessage::Close) | None => break,
        }
    }
    let _ = writer.shutdown().await;
}

fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
    )
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn os_signals(ctx: Arc<ServerContext>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut interrupt), Ok(mut terminate), Ok(mut reload)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::user_defined1()),
    ) else {
        error!("failed to install signal handlers");
        return std::future::pending().await;
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("received SIGINT");
                return;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = reload.recv() => {
                info!("received SIGUSR1, reloading configuration");
                let ctx = Arc::clone(&ctx);
                match tokio::task::spawn_blocking(move || ctx.reload()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %format!("{e:#}"), "reload failed"),
                    Err(e) => error!(error = %e, "reload task failed"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn os_signals(_ctx: Arc<ServerContext>) {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("received Ctrl-C");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
