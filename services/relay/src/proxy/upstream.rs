//! The fixed upstream target.
//!
//! The target is resolved once at startup; every session connects to that
//! same address with a bounded connect timeout.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolved upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// The `host:port` the address was resolved from.
    target: String,
    /// Resolved socket address.
    addr: SocketAddr,
    /// Connect timeout.
    connect_timeout: Duration,
}

impl Upstream {
    /// Use an already resolved address.
    pub fn new(addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            target: addr.to_string(),
            addr,
            connect_timeout,
        }
    }

    /// Resolve `target` (`host:port`) and keep the first address.
    pub async fn resolve(target: &str, connect_timeout: Duration) -> io::Result<Self> {
        let addr = lookup_host(target).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{target} did not resolve to any address"),
            )
        })?;

        info!(target, upstream_addr = %addr, "Resolved upstream");

        Ok(Self {
            target: target.to_string(),
            addr,
            connect_timeout,
        })
    }

    /// The resolved address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The configured target string.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Open a new connection to the upstream.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        debug!(upstream_addr = %self.addr, "Connecting to upstream");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timeout",
                ))
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
