//! Error types for the event pipeline.

use std::time::Duration;

use thiserror::Error;

/// Errors returned to producers by the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The pipeline has been shut down and no longer accepts events.
    #[error("pipeline is closed")]
    Closed,

    /// A bounded wait on the pipeline expired.
    #[error("pipeline wait for sequence {sequence} timed out after {waited:?}")]
    Timeout { sequence: u64, waited: Duration },

    /// The consumer thread could not be started.
    #[error("failed to start log writer: {0}")]
    Spawn(String),

    /// The ring capacity is invalid.
    #[error("invalid ring capacity: {0}")]
    InvalidCapacity(usize),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
