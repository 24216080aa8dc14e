//! Error types for the sync engine.
//!
//! Nothing here crosses the synchronizer boundary as an exception: remote
//! failures surface through state and backoff, local mutation failures as
//! booleans. `SyncError` exists for asynchronous outcomes handed to
//! callers through [`DataReadyHandle`](crate::DataReadyHandle).

use thiserror::Error;

/// Result type for sync outcomes.
pub type SyncResult<T> = Result<T, SyncError>;

/// Asynchronous failure outcomes of the sync engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The synchronizer shut down before the outcome settled.
    #[error("sync cancelled")]
    Cancelled,

    /// Entry bodies could not be fetched after all retry attempts.
    #[error("data unavailable in database {database_id}")]
    DataUnavailable {
        /// The database whose entries could not be fetched.
        database_id: String,
    },
}
