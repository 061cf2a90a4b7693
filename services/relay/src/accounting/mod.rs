//! Per-client traffic accounting.
//!
//! Sessions report inbound bytes through a [`TrafficAccountant`] handle. The
//! handle never blocks: updates are queued with `try_send` and applied by a
//! single worker task against a [`CounterStore`]. Accounting is best-effort;
//! a full queue or an unreachable store is counted and logged, never
//! propagated to the relay.
//!
//! ```text
//! Session ─┐
//! Session ─┼─ account() ─► mpsc (bounded) ─► worker ─► CounterStore
//! Session ─┘    try_send                               (INCRBY / memory)
//! ```

mod memory;
mod resp;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use memory::MemoryCounterStore;
pub use resp::{RespConnection, RespCounterStore, Reply, UpdatePolicy};

/// Default number of queued, not yet applied updates.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Default bound on a single counter store request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on draining the queue at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a counter store.
#[derive(Debug, Error)]
pub enum CounterError {
    /// Could not connect to the store.
    #[error("failed to connect to counter store at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// Connecting to the store took too long.
    #[error("connect to counter store at {0} timed out")]
    ConnectTimeout(String),

    /// The store did not answer a request in time.
    #[error("counter store at {addr} did not reply within {after:?}")]
    Timeout { addr: String, after: Duration },

    /// I/O failure on an established connection.
    #[error("counter store I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store closed the connection.
    #[error("counter store closed the connection")]
    Disconnected,

    /// The store sent something we could not parse.
    #[error("counter store protocol error: {0}")]
    Protocol(String),

    /// The store answered with an error reply.
    #[error("counter store error reply: {0}")]
    Server(String),
}

/// A key to integer increment service.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Add `delta` to `key`, returning the new total.
    async fn increment_by(&self, key: &str, delta: u64) -> Result<i64, CounterError>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// How the relay records per-client byte counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// Atomic `INCRBY` against a RESP store.
    IncrBy,
    /// Non-atomic `GET` then `SET` against a RESP store.
    GetSet,
    /// In-process counters only.
    Memory,
}

impl FromStr for CounterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incrby" => Ok(Self::IncrBy),
            "get-set" => Ok(Self::GetSet),
            "memory" => Ok(Self::Memory),
            other => Err(format!(
                "unknown counter mode {other:?} (expected incrby, get-set, or memory)"
            )),
        }
    }
}

impl fmt::Display for CounterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IncrBy => "incrby",
            Self::GetSet => "get-set",
            Self::Memory => "memory",
        })
    }
}

/// Build the store selected by `mode`.
pub fn build_store(
    mode: CounterMode,
    redis_addr: &str,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Arc<dyn CounterStore> {
    let policy = match mode {
        CounterMode::Memory => return Arc::new(MemoryCounterStore::new()),
        CounterMode::IncrBy => UpdatePolicy::IncrBy,
        CounterMode::GetSet => {
            warn!(
                redis_addr,
                "GET/SET accounting is not atomic; concurrent sessions for one client can lose updates"
            );
            UpdatePolicy::GetSet
        }
    };

    Arc::new(
        RespCounterStore::new(redis_addr, policy, connect_timeout)
            .with_request_timeout(request_timeout),
    )
}

/// Statistics for traffic accounting.
#[derive(Debug, Default)]
pub struct AccountingStats {
    /// Updates accepted into the queue.
    pub queued: AtomicU64,
    /// Updates the store acknowledged.
    pub applied: AtomicU64,
    /// Updates the store rejected or could not be reached for.
    pub failed: AtomicU64,
    /// Updates dropped because the queue was full or closed.
    pub dropped: AtomicU64,
}

/// Point-in-time copy of [`AccountingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountingStatsSnapshot {
    pub queued: u64,
    pub applied: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl AccountingStats {
    pub fn snapshot(&self) -> AccountingStatsSnapshot {
        AccountingStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Increment {
    key: String,
    delta: u64,
}

/// Cloneable, non-blocking accounting handle used by sessions.
#[derive(Clone)]
pub struct TrafficAccountant {
    tx: mpsc::Sender<Increment>,
    stats: Arc<AccountingStats>,
}

impl TrafficAccountant {
    /// Record `delta` bytes for `identity`. Never blocks.
    pub fn account(&self, identity: &str, delta: u64) {
        if delta == 0 {
            return;
        }

        let increment = Increment {
            key: identity.to_string(),
            delta,
        };

        match self.tx.try_send(increment) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %dropped.key,
                    delta = dropped.delta,
                    "Accounting queue full, dropping update"
                );
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %dropped.key, "Accounting stopped, dropping update");
            }
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> &AccountingStats {
        &self.stats
    }
}

/// Owner of the accounting worker.
pub struct Accounting {
    accountant: TrafficAccountant,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
    drain_timeout: Duration,
}

impl Accounting {
    /// Start the worker applying updates to `store`.
    pub fn start(store: Arc<dyn CounterStore>, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(AccountingStats::default());

        info!(store = store.name(), queue_capacity, "Accounting started");

        let worker = tokio::spawn(run_worker(store, rx, shutdown_rx, Arc::clone(&stats)));

        Self {
            accountant: TrafficAccountant { tx, stats },
            shutdown_tx,
            worker,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Bound the shutdown drain; updates still queued after it are lost.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// A handle for sessions.
    pub fn accountant(&self) -> TrafficAccountant {
        self.accountant.clone()
    }

    /// Apply everything already queued, then stop the worker.
    ///
    /// The drain is bounded by the drain timeout.
    pub async fn shutdown(mut self) -> AccountingStatsSnapshot {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(self.drain_timeout, &mut self.worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Accounting worker panicked"),
            Err(_) => {
                self.worker.abort();
                warn!(
                    drain_timeout = ?self.drain_timeout,
                    "Accounting drain timed out, abandoning queued updates"
                );
            }
        }

        let snapshot = self.accountant.stats.snapshot();
        info!(
            applied = snapshot.applied,
            failed = snapshot.failed,
            dropped = snapshot.dropped,
            "Accounting shut down"
        );
        snapshot
    }
}

async fn run_worker(
    store: Arc<dyn CounterStore>,
    mut rx: mpsc::Receiver<Increment>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<AccountingStats>,
) {
    loop {
        tokio::select! {
            biased;
            increment = rx.recv() => match increment {
                Some(increment) => apply(store.as_ref(), increment, &stats).await,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                rx.close();
                while let Some(increment) = rx.recv().await {
                    apply(store.as_ref(), increment, &stats).await;
                }
                break;
            }
        }
    }

    debug!(store = store.name(), "Accounting worker stopped");
}

async fn apply(store: &dyn CounterStore, increment: Increment, stats: &AccountingStats) {
    match store.increment_by(&increment.key, increment.delta).await {
        Ok(total) => {
            stats.applied.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %increment.key,
                delta = increment.delta,
                total,
                "Counter updated"
            );
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                store = store.name(),
                key = %increment.key,
                delta = increment.delta,
                error = %e,
                "Counter update failed"
            );
        }
    }
}
