//! Pipeline handle and the dedicated consumer thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::event::Event;
use crate::ring::{Claim, Receipt, RingBuffer, Taken};
use crate::sink::EventWriter;
use crate::stats::{PipelineStats, PipelineStatsSnapshot};

/// Default number of ring slots.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of ring slots.
    pub capacity: usize,
    /// Upper bound on any producer wait (free slot or receipt).
    pub wait_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            wait_timeout: None,
        }
    }
}

/// Owner of the ring buffer and its consumer thread.
///
/// Producers obtain a [`Publisher`]; the owner calls [`Pipeline::shutdown`]
/// to drain outstanding events and stop the consumer.
pub struct Pipeline {
    ring: Arc<RingBuffer>,
    consumer: Option<thread::JoinHandle<()>>,
}

impl Pipeline {
    /// Build the ring and start the consumer thread feeding `writer`.
    pub fn start<W: EventWriter>(config: PipelineConfig, writer: W) -> Result<Self> {
        let stats = Arc::new(PipelineStats::default());
        let ring = Arc::new(RingBuffer::new(
            config.capacity,
            config.wait_timeout,
            stats,
        )?);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        let consumer_ring = Arc::clone(&ring);
        let consumer = thread::Builder::new()
            .name("tapline-log-writer".to_string())
            .spawn(move || runtime.block_on(consume(consumer_ring, writer)))
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        info!(capacity = config.capacity, "Pipeline started");

        Ok(Self {
            ring,
            consumer: Some(consumer),
        })
    }

    /// A cloneable producer handle.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            ring: Arc::clone(&self.ring),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(self.ring.stats())
    }

    /// Stop accepting events, drain everything already claimed, and stop
    /// the consumer. The sink is closed before this returns.
    pub async fn shutdown(mut self) -> PipelineStatsSnapshot {
        self.ring.begin_close();

        if let Some(consumer) = self.consumer.take() {
            match tokio::task::spawn_blocking(move || consumer.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("Log writer thread panicked"),
                Err(e) => error!(error = %e, "Failed to join log writer thread"),
            }
        }

        let snapshot = self.ring.stats().snapshot();
        info!(
            consumed = snapshot.consumed,
            write_failures = snapshot.write_failures,
            abandoned = snapshot.abandoned,
            "Pipeline shut down"
        );
        snapshot
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Without an explicit shutdown the consumer still drains and exits
        // on its own thread.
        self.ring.begin_close();
    }
}

/// Producer side of the pipeline.
#[derive(Clone)]
pub struct Publisher {
    ring: Arc<RingBuffer>,
}

impl Publisher {
    /// Reserve a slot, waiting while the ring is full.
    pub async fn claim(&self) -> Result<Claim> {
        self.ring.claim().await
    }

    /// Claim a slot and publish `event` into it.
    pub async fn publish(&self, event: Event) -> Result<Receipt> {
        Ok(self.claim().await?.publish(event))
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Shared counters.
    pub fn stats(&self) -> &PipelineStats {
        self.ring.stats()
    }
}

async fn consume<W: EventWriter>(ring: Arc<RingBuffer>, mut writer: W) {
    let stats = Arc::clone(ring.stats());
    let mut sequence = 0u64;

    while let Some(taken) = ring.take(sequence).await {
        match taken {
            Taken::Event(event) => {
                if let Err(e) = writer.write(sequence, &event) {
                    stats
                        .write_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    error!(
                        sequence,
                        tag = %event.tag,
                        bytes = event.len(),
                        error = %e,
                        "Log write failed, dropping event"
                    );
                }
            }
            Taken::Abandoned => {
                debug!(sequence, "Skipping abandoned claim");
            }
        }

        sequence += 1;
        ring.mark_consumed(sequence);
    }

    if let Err(e) = writer.close() {
        warn!(error = %e, "Failed to close log sink");
    }
    ring.mark_closed();
    debug!(drained = sequence, "Log writer stopped");
}
