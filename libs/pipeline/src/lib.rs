//! tapline event pipeline.
//!
//! Bounded hand-off between many relay sessions (producers) and one durable
//! log writer (consumer).
//!
//! ## Architecture
//!
//! ```text
//! Session ─┐                                     ┌─ single-file log
//! Session ─┼─ claim ─► RingBuffer (N slots) ─► consumer ─┤
//! Session ─┘  publish        │                  thread   └─ per-event files
//!                            └──── consumed cursor ───► Receipt::wait
//! ```
//!
//! - A producer claims a sequence, fills the slot, publishes it, and gets a
//!   [`Receipt`] for that exact sequence.
//! - Claims wait while `N` events are unconsumed, so a slow disk throttles
//!   producers instead of growing memory.
//! - The consumer writes events strictly in sequence order, fsyncs each one,
//!   and counts (then skips) any event the sink rejects.

mod error;
mod event;
mod pipeline;
mod ring;
mod sink;
mod stats;

pub use error::{PipelineError, Result};
pub use event::Event;
pub use pipeline::{Pipeline, PipelineConfig, Publisher, DEFAULT_CAPACITY};
pub use ring::{Claim, Receipt};
pub use sink::{
    event_file_name, record_separator, DurableLog, EventWriter, LogLayout, RECORD_SEPARATOR,
};
pub use stats::{PipelineStats, PipelineStatsSnapshot};
