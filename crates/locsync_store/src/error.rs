//! Error types for the location store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced peer-location row does not exist.
    #[error("unknown peer location index {0}")]
    UnknownLocation(u64),

    /// The referenced database row does not exist.
    #[error("unknown database index {0}")]
    UnknownDatabase(u64),
}
