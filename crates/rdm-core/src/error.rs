//! Download error taxonomy.
//!
//! Validation strings are part of the public surface (the API layer matches
//! on them), so they are produced verbatim here and must not be reworded.

use thiserror::Error;

/// Error raised by a download, a chunk, or pre-flight validation.
///
/// `InvalidParameters` carries its message verbatim because callers match on
/// the exact string. Per-piece fetch failures stay internal to the scheduler
/// and only surface as `InsufficientHosts` once a chunk runs out of sources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Pre-flight validation failure. The message is the user-visible string.
    #[error("{0}")]
    InvalidParameters(String),

    /// A chunk could not gather enough piece sources to recover.
    #[error("insufficient hosts to recover chunk {chunk_index}: {available} of {needed} required pieces reachable")]
    InsufficientHosts {
        chunk_index: u64,
        available: usize,
        needed: usize,
    },

    /// A single piece fetch failed. Transient; retried via standby promotion.
    #[error("piece fetch failed: {0}")]
    HostFetchFailed(String),

    /// Erasure decode failed. Fatal for the chunk.
    #[error("chunk decode failed: {0}")]
    DecodeFailed(String),

    /// Writing decoded bytes to the destination failed. Fatal for the download.
    #[error("destination write failed: {0}")]
    DestinationWriteFailed(String),

    /// The memory manager refused a reservation. Only happens at shutdown.
    #[error("memory request denied by shutdown")]
    MemoryDenied,

    /// The renter is shutting down, or the download was cancelled.
    #[error("download interrupted by shutdown")]
    Interrupted,
}

impl DownloadError {
    /// Shorthand for a validation error with a caller-visible message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        DownloadError::InvalidParameters(msg.into())
    }
}

/// Render an accumulated error list the way download history reports it:
/// first error is the primary, later errors are appended with `; `.
pub fn compose(errors: &[DownloadError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
