//! TCP listener and connection handling.
//!
//! Accepts client connections, connects each one to the fixed upstream, and
//! runs a [`RelaySession`] for it. Accepting never waits on any session: the
//! upstream connect happens inside the per-connection task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::session::{CloseReason, RelaySession, SessionContext};
use super::upstream::Upstream;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Upstream connection successes.
    pub upstream_connected: AtomicU64,
    /// Upstream connection failures.
    pub upstream_failed: AtomicU64,
    /// Sessions that ended on an I/O or pipeline fault.
    pub sessions_failed: AtomicU64,
    /// Bytes relayed to the upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed back to clients.
    pub bytes_from_upstream: AtomicU64,
}

/// A TCP listener for the relay.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// The fixed upstream.
    upstream: Upstream,
    /// Collaborators cloned into each session.
    context: SessionContext,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        upstream: Upstream,
        context: SessionContext,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            upstream_addr = %upstream.addr(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            upstream,
            context,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept and relay connections until `shutdown` flips to `true`.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            max_connections = self.config.max_connections,
            "Listener started"
        );

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(bind_addr = %local_addr, "Listener stopping");
                        return Ok(());
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Connection error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        debug!(peer_addr = %peer_addr, "Handling connection");

        let upstream = match self.upstream.connect().await {
            Ok(stream) => {
                self.stats.upstream_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(e) => {
                self.stats.upstream_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    upstream_addr = %self.upstream.addr(),
                    error = %e,
                    "Upstream connection failed, dropping client"
                );
                return Ok(());
            }
        };
        client.set_nodelay(true)?;

        let session = RelaySession::new(client, upstream, peer_addr, self.context.clone());
        let summary = session.run().await;

        self.stats
            .bytes_to_upstream
            .fetch_add(summary.bytes_to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(summary.bytes_from_upstream, Ordering::Relaxed);

        let reason = &summary.reason;
        if reason.is_error() {
            self.stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
        }
        match reason {
            CloseReason::Pipeline { .. } => warn!(reason = %reason, "Session closed by log pipeline"),
            _ if reason.is_error() => debug!(reason = %reason, "Session closed on error"),
            _ => debug!(reason = %reason, "Session closed"),
        }

        debug!(
            bytes_to_upstream = summary.bytes_to_upstream,
            bytes_from_upstream = summary.bytes_from_upstream,
            events_published = summary.events_published,
            "Connection closed"
        );

        Ok(())
    }
}
