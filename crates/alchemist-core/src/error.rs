//! Error types for the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Handle type was never registered with the allocator
    #[error("Unknown handle type: {0}")]
    UnknownHandleType(usize),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
