//! Error taxonomy for the repair engine.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RepairError>;

/// Failure modes of a repair pass.
///
/// `Io` aborts the current file's repair and leaves the original in place;
/// `Corruption` marks a file as unrepairable (an index hit by it is removed
/// rather than left half-rewritten); `InvalidArgument` reports misuse of the
/// in-memory API before any file is touched.
#[derive(Debug, Error)]
pub enum RepairError {
    /// Underlying open/read/write/seek failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk structure does not match the fixed layout.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Caller-supplied value violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
