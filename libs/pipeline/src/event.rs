//! The unit moved through the pipeline.

use bytes::Bytes;

/// A tagged payload waiting to be written to the durable log.
///
/// Events are immutable once published. They carry no identity of their own;
/// the pipeline sequence number they were published under is their only
/// ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Direction and peer identity, e.g. `[IN] 10.0.0.7`.
    pub tag: String,
    /// Raw relayed bytes.
    pub payload: Bytes,
}

impl Event {
    /// Create a new event.
    pub fn new(tag: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
