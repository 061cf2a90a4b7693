//! L4 TCP relay implementation.
//!
//! This module provides:
//! - TCP listener management
//! - The fixed upstream target
//! - Per-connection relay sessions that log and account traffic
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> RelaySession -> Upstream
//!                           |
//!                           +-> TrafficAccountant (inbound bytes)
//!                           +-> Publisher -> log writer thread -> Log
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, SessionContext, Upstream};
//!
//! let upstream = Upstream::resolve("localhost:80", DEFAULT_CONNECT_TIMEOUT).await?;
//! let config = ListenerConfig::new("0.0.0.0:54545".parse()?);
//! let listener = Arc::new(Listener::bind(config, upstream, context).await?);
//! listener.run(shutdown_rx).await?;
//! ```

mod listener;
mod session;
mod upstream;

pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use session::{
    relay, AckMode, CloseReason, Direction, RelaySession, SessionContext, SessionSummary,
    DEFAULT_CHUNK_SIZE,
};
pub use upstream::{Upstream, DEFAULT_CONNECT_TIMEOUT};
