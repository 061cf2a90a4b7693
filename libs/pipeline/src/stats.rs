//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Sequences handed out to producers.
    pub claimed: AtomicU64,
    /// Sequences published with an event.
    pub published: AtomicU64,
    /// Sequences fully processed by the consumer (written, failed, or skipped).
    pub consumed: AtomicU64,
    /// Claims dropped without publishing.
    pub abandoned: AtomicU64,
    /// Events dropped because the log sink rejected them.
    pub write_failures: AtomicU64,
    /// Bounded waits (slot or receipt) that expired.
    pub ack_timeouts: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub claimed: u64,
    pub published: u64,
    pub consumed: u64,
    pub abandoned: u64,
    pub write_failures: u64,
    pub ack_timeouts: u64,
}

impl PipelineStats {
    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
        }
    }
}
