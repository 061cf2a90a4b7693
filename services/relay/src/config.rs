//! Relay configuration.
//!
//! Everything is env-driven; there is no reload. Invalid values are fatal at
//! startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tapline_pipeline::LogLayout;

use crate::accounting::CounterMode;
use crate::proxy::AckMode;

/// Default listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 54545;

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Fixed upstream target as `host:port`, resolved once at startup.
    pub target: String,

    /// How per-client byte counts are recorded.
    pub counter: CounterMode,

    /// Counter store address as `host:port`.
    pub redis_addr: String,

    /// Bound on one counter store update.
    pub counter_timeout: Duration,

    /// Log layout and location.
    pub log_layout: LogLayout,

    /// Number of pipeline ring slots.
    pub ring_capacity: usize,

    /// Per-read scratch buffer size.
    pub chunk_size: usize,

    /// When a session waits for its log write.
    pub ack_mode: AckMode,

    /// Bound on any pipeline wait before the session is closed.
    pub ack_timeout: Duration,

    /// Upstream connect timeout.
    pub connect_timeout: Duration,

    /// Maximum concurrent sessions.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = parse_var(
            &lookup,
            "RELAY_LISTEN_ADDR",
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
        )?;

        let target = lookup("RELAY_TARGET").unwrap_or_else(|| "localhost:80".to_string());
        if target.rsplit_once(':').is_none() {
            bail!("RELAY_TARGET must be host:port, got {target:?}.");
        }

        let counter = parse_var(&lookup, "RELAY_COUNTER", CounterMode::IncrBy)?;
        let redis_addr =
            lookup("RELAY_REDIS_ADDR").unwrap_or_else(|| "127.0.0.1:6379".to_string());
        let counter_timeout_ms: u64 = parse_var(&lookup, "RELAY_COUNTER_TIMEOUT_MS", 2_000)?;
        let counter_timeout = Duration::from_millis(counter_timeout_ms.max(1));

        let log_path = PathBuf::from(lookup("RELAY_LOG_PATH").unwrap_or_else(|| "Log".to_string()));
        let log_layout = match lookup("RELAY_LOG_LAYOUT").as_deref() {
            None | Some("single-file") => LogLayout::SingleFile(log_path),
            Some("per-event") => LogLayout::PerEventFile(log_path),
            Some(other) => {
                bail!("RELAY_LOG_LAYOUT must be single-file or per-event, got {other:?}.")
            }
        };

        let ring_capacity: usize = parse_var(&lookup, "RELAY_RING_CAPACITY", 1024)?;
        if ring_capacity == 0 {
            bail!("RELAY_RING_CAPACITY must be at least 1.");
        }

        let chunk_size: usize = parse_var(&lookup, "RELAY_CHUNK_SIZE", 1024)?;
        if chunk_size == 0 {
            bail!("RELAY_CHUNK_SIZE must be at least 1.");
        }

        let ack_mode = parse_var(&lookup, "RELAY_ACK_MODE", AckMode::PerChunk)?;

        let ack_timeout_ms: u64 = parse_var(&lookup, "RELAY_ACK_TIMEOUT_MS", 30_000)?;
        let ack_timeout = Duration::from_millis(ack_timeout_ms.max(1));

        let connect_timeout_ms: u64 = parse_var(&lookup, "RELAY_CONNECT_TIMEOUT_MS", 2_000)?;
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let max_connections: usize = parse_var(&lookup, "RELAY_MAX_CONNECTIONS", 10_000)?;

        let log_level = lookup("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            target,
            counter,
            redis_addr,
            counter_timeout,
            log_layout,
            ring_capacity,
            chunk_size,
            ack_mode,
            ack_timeout,
            connect_timeout,
            max_connections: max_connections.max(1),
            log_level,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{name} has an invalid value: {raw:?}.")),
    }
}
