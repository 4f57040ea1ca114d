//! Typed errors for the seams callers need to match on.
//!
//! Everything else in the crate propagates `anyhow::Error`.

use thiserror::Error;

/// Failure of a bounded queue read.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("no item arrived before the timeout")]
    Timeout,
    #[error("queue disconnected")]
    Disconnected,
}

/// Failure of a state registry lookup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown source id: {0}")]
    NotFound(String),
}

/// Failure of a single frame read from a decode source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source has no more frames (file end, closed stream).
    #[error("end of stream")]
    EndOfStream,
    /// A read failed; may be transient.
    #[error("read failed: {0}")]
    Read(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, SourceError::EndOfStream)
    }
}
