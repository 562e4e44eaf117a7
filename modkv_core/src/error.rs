//! Error types shared across the store and the distribution layer

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error kinds surfaced by the storage engine and its callers.
///
/// `NotFound` is part of normal control flow and is never logged as an
/// error; the remaining kinds are logged where they are detected.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key absent on read, update or delete
    #[error("key {0} not found")]
    NotFound(i32),

    /// Insert on a key that is already present
    #[error("key {0} already exists")]
    AlreadyExists(i32),

    /// Insufficient free space in the segment
    #[error("out of capacity: need {needed} bytes, {free} free")]
    OutOfCapacity { needed: usize, free: usize },

    /// Cannot attach to a segment or reach a peer
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Segment exists but its contents are not usable
    #[error("corrupt segment: {0}")]
    Corrupt(String),

    /// RPC call failed after a connection was established
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed configuration or mapping data
    #[error("config error: {0}")]
    Config(String),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for the kinds that describe an absent key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
