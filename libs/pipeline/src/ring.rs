//! Fixed-capacity ring buffer with two-phase claim/publish hand-off.
//!
//! Producers reserve a sequence with [`RingBuffer::claim`], fill the slot at
//! `sequence % capacity` and publish it. The single consumer drains slots in
//! strictly increasing sequence order and advances a consumed cursor that
//! every producer can observe.
//!
//! ## Invariants
//!
//! - At most `capacity` claimed-but-unconsumed sequences exist at once. A
//!   claim for `s` waits until sequence `s - capacity` has been consumed.
//! - Each slot carries the sequence it was last published under, so the
//!   consumer never mistakes a stale slot for a fresh one and never skips a
//!   sequence whose producer is slow to publish.
//! - A claim that is dropped unpublished is recorded as abandoned; the
//!   consumer skips it instead of waiting forever.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::{watch, Notify};

use crate::error::{PipelineError, Result};
use crate::event::Event;
use crate::stats::PipelineStats;

/// Consumer progress shared with producers.
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    /// Every sequence below this value has been consumed.
    consumed: u64,
    /// The consumer has exited; nothing further will be consumed.
    closed: bool,
}

struct Slot {
    event: ArcSwapOption<Event>,
    /// `sequence + 1` of the last publish into this slot, 0 if never used.
    published: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            event: ArcSwapOption::empty(),
            published: AtomicU64::new(0),
        }
    }
}

/// What the consumer found at a sequence.
#[derive(Debug)]
pub(crate) enum Taken {
    /// A published event.
    Event(Arc<Event>),
    /// The producer dropped its claim without publishing.
    Abandoned,
}

pub(crate) struct RingBuffer {
    slots: Box<[Slot]>,
    capacity: u64,
    /// Next sequence to hand out.
    next_sequence: AtomicU64,
    progress: watch::Sender<Progress>,
    /// Wakes the consumer after a publish, an abandon, or a close request.
    activity: Notify,
    abandoned: Mutex<BTreeSet<u64>>,
    closing: AtomicBool,
    wait_timeout: Option<Duration>,
    stats: Arc<PipelineStats>,
}

impl RingBuffer {
    pub(crate) fn new(
        capacity: usize,
        wait_timeout: Option<Duration>,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidCapacity(capacity));
        }

        let (progress, _) = watch::channel(Progress::default());

        Ok(Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            capacity: capacity as u64,
            next_sequence: AtomicU64::new(0),
            progress,
            activity: Notify::new(),
            abandoned: Mutex::new(BTreeSet::new()),
            closing: AtomicBool::new(false),
            wait_timeout,
            stats,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub(crate) fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    fn slot(&self, sequence: u64) -> &Slot {
        &self.slots[(sequence % self.capacity) as usize]
    }

    /// Reserve the next sequence, waiting while the ring is full.
    pub(crate) async fn claim(self: &Arc<Self>) -> Result<Claim> {
        if self.closing.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        self.stats.claimed.fetch_add(1, Ordering::Relaxed);

        // Created before waiting so a cancelled or timed-out claim is still
        // accounted for by the consumer.
        let claim = Claim {
            ring: Arc::clone(self),
            sequence,
            published: false,
        };

        let free_at = (sequence + 1).saturating_sub(self.capacity);
        self.wait_consumed(sequence, free_at).await?;

        Ok(claim)
    }

    fn publish(&self, sequence: u64, event: Event) {
        let slot = self.slot(sequence);
        slot.event.store(Some(Arc::new(event)));
        slot.published.store(sequence + 1, Ordering::Release);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.activity.notify_one();
    }

    fn abandon(&self, sequence: u64) {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sequence);
        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
        self.activity.notify_one();
    }

    /// Wait until `consumed >= threshold`, honoring the configured bound.
    async fn wait_consumed(&self, sequence: u64, threshold: u64) -> Result<()> {
        let mut progress = self.progress.subscribe();
        let wait = progress.wait_for(|p| p.closed || p.consumed >= threshold);

        let observed = match self.wait_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.map(|p| *p),
                Err(_) => {
                    self.stats.ack_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(PipelineError::Timeout {
                        sequence,
                        waited: limit,
                    });
                }
            },
            None => wait.await.map(|p| *p),
        };

        match observed {
            Ok(p) if p.consumed >= threshold => Ok(()),
            _ => Err(PipelineError::Closed),
        }
    }

    /// Wait for `sequence` to be published or abandoned.
    ///
    /// Returns `None` once the ring is closing and every claimed sequence
    /// below `sequence` has been handed out to the consumer.
    pub(crate) async fn take(&self, sequence: u64) -> Option<Taken> {
        let slot = self.slot(sequence);

        loop {
            if slot.published.load(Ordering::Acquire) == sequence + 1 {
                return Some(match slot.event.swap(None) {
                    Some(event) => Taken::Event(event),
                    None => Taken::Abandoned,
                });
            }

            if self
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&sequence)
            {
                return Some(Taken::Abandoned);
            }

            if self.closing.load(Ordering::Acquire)
                && sequence >= self.next_sequence.load(Ordering::Acquire)
            {
                return None;
            }

            self.activity.notified().await;
        }
    }

    /// Record that every sequence below `consumed` is done.
    pub(crate) fn mark_consumed(&self, consumed: u64) {
        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        self.progress.send_modify(|p| p.consumed = consumed);
    }

    /// Record that the consumer has exited.
    pub(crate) fn mark_closed(&self) {
        self.progress.send_modify(|p| p.closed = true);
    }

    /// Refuse new claims and wake the consumer so it can drain and exit.
    pub(crate) fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.activity.notify_one();
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// An exclusively owned, not yet published sequence.
///
/// Dropping a claim without publishing marks the sequence abandoned.
#[must_use = "a claim must be published or it is logged as abandoned"]
pub struct Claim {
    ring: Arc<RingBuffer>,
    sequence: u64,
    published: bool,
}

impl Claim {
    /// The reserved sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Publish `event` into the claimed slot.
    pub fn publish(mut self, event: Event) -> Receipt {
        self.ring.publish(self.sequence, event);
        self.published = true;

        Receipt {
            ring: Arc::clone(&self.ring),
            sequence: self.sequence,
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.published {
            self.ring.abandon(self.sequence);
        }
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("sequence", &self.sequence)
            .field("published", &self.published)
            .finish()
    }
}

/// Completion handle for one published sequence.
pub struct Receipt {
    ring: Arc<RingBuffer>,
    sequence: u64,
}

impl Receipt {
    /// The published sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the consumer has already processed this sequence.
    pub fn is_done(&self) -> bool {
        self.ring.progress.borrow().consumed > self.sequence
    }

    /// Wait until the consumer has processed this sequence.
    ///
    /// Resolves once the event has been written (or dropped after a sink
    /// failure). Fails with [`PipelineError::Closed`] if the consumer exits
    /// first, or [`PipelineError::Timeout`] if the configured bound expires.
    pub async fn wait(self) -> Result<()> {
        self.ring
            .wait_consumed(self.sequence, self.sequence + 1)
            .await
    }
}

impl std::fmt::Debug for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receipt")
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> Arc<RingBuffer> {
        Arc::new(RingBuffer::new(capacity, None, Arc::new(PipelineStats::default())).unwrap())
    }

    async fn consume_one(ring: &RingBuffer, sequence: u64) -> Taken {
        let taken = ring.take(sequence).await.unwrap();
        ring.mark_consumed(sequence + 1);
        taken
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = RingBuffer::new(0, None, Arc::new(PipelineStats::default()));
        assert!(matches!(result, Err(PipelineError::InvalidCapacity(0))));
    }

    #[tokio::test]
    async fn test_claims_are_sequential() {
        let ring = ring(8);
        let a = ring.claim().await.unwrap();
        let b = ring.claim().await.unwrap();
        assert_eq!(a.sequence(), 0);
        assert_eq!(b.sequence(), 1);
        let _ = a.publish(Event::new("a", &b"1"[..]));
        let _ = b.publish(Event::new("b", &b"2"[..]));
    }

    #[tokio::test]
    async fn test_claim_blocks_when_full() {
        let ring = ring(4);

        for i in 0..4u8 {
            let claim = ring.claim().await.unwrap();
            let _ = claim.publish(Event::new("fill", vec![i]));
        }

        // Fifth claim must wait for the consumer.
        let pending = tokio::spawn({
            let ring = Arc::clone(&ring);
            async move { ring.claim().await.map(|c| c.sequence()) }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "claim should block on a full ring");

        match consume_one(&ring, 0).await {
            Taken::Event(event) => assert_eq!(event.payload.as_ref(), &[0u8]),
            Taken::Abandoned => panic!("sequence 0 was published"),
        }

        let sequence = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("claim should complete after a slot frees")
            .unwrap()
            .unwrap();
        assert_eq!(sequence, 4);
    }

    #[tokio::test]
    async fn test_consumer_waits_for_out_of_order_publish() {
        let ring = ring(4);
        let first = ring.claim().await.unwrap();
        let second = ring.claim().await.unwrap();

        let _ = second.publish(Event::new("second", &b"2"[..]));

        let take_first = tokio::spawn({
            let ring = Arc::clone(&ring);
            async move { ring.take(0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!take_first.is_finished(), "consumer must not skip a gap");

        let _ = first.publish(Event::new("first", &b"1"[..]));
        match take_first.await.unwrap() {
            Some(Taken::Event(event)) => assert_eq!(event.tag, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_claim_is_skipped() {
        let ring = ring(4);
        let claim = ring.claim().await.unwrap();
        drop(claim);

        assert!(matches!(consume_one(&ring, 0).await, Taken::Abandoned));
        assert_eq!(ring.stats().abandoned.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_receipt_resolves_after_consumption() {
        let ring = ring(4);
        let receipt = ring
            .claim()
            .await
            .unwrap()
            .publish(Event::new("t", &b"x"[..]));
        assert!(!receipt.is_done());

        consume_one(&ring, 0).await;
        assert!(receipt.is_done());
        receipt.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_receipt_times_out() {
        let stats = Arc::new(PipelineStats::default());
        let ring = Arc::new(
            RingBuffer::new(4, Some(Duration::from_millis(20)), Arc::clone(&stats)).unwrap(),
        );
        let receipt = ring
            .claim()
            .await
            .unwrap()
            .publish(Event::new("t", &b"x"[..]));

        let result = receipt.wait().await;
        assert!(matches!(result, Err(PipelineError::Timeout { sequence: 0, .. })));
        assert_eq!(stats.ack_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_closed_ring_rejects_claims() {
        let ring = ring(4);
        ring.begin_close();
        assert!(ring.is_closing());
        assert_eq!(ring.claim().await.unwrap_err(), PipelineError::Closed);
        assert!(ring.take(0).await.is_none());
    }

    #[tokio::test]
    async fn test_receipt_fails_when_consumer_exits() {
        let ring = ring(4);
        let receipt = ring
            .claim()
            .await
            .unwrap()
            .publish(Event::new("t", &b"x"[..]));
        ring.mark_closed();
        assert_eq!(receipt.wait().await.unwrap_err(), PipelineError::Closed);
    }
}
