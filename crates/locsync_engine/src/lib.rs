//! # locsync engine
//!
//! Two-level synchronizer for peer-location databases.
//!
//! This crate provides:
//! - [`LocationSync`]: the per-location database-list synchronizer
//! - [`DatabaseSync`]: the per-database entry synchronizer
//! - Bounded exponential backoff for remote retries
//! - Incoming-subscription bookkeeping with coalesced notifies
//! - Lazy entry-body download with promise fan-in
//!
//! ## Architecture
//!
//! One `LocationSync` exists per remote peer location and owns every
//! `DatabaseSync` for that location in an arena keyed by database ID.
//! The pair shares a single [`locsync_store::LocationStore`] and a single
//! outgoing [`MessageSender`]; all outstanding requests resolve through
//! one pending-request table on the list layer.
//!
//! The engine is one logical actor per peer location: a plain `&mut self`
//! state machine the embedder drives with message arrivals, responses,
//! timeouts, and periodic `step` calls, each carrying the current time.
//! There are no locks here and no wall-clock reads.
//!
//! ## Key invariants
//!
//! - Every `step_*` sub-step is idempotent; re-running the fixed step
//!   order is always safe.
//! - At most one list subscribe, one database subscribe, and one data-get
//!   is in flight per synchronizer at any time.
//! - Remote failures never surface as errors: they engage backoff and the
//!   synchronizer stays pending, retrying.
//! - Shutdown aborts the protocol but never rolls persisted data back.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod config;
mod database;
mod error;
mod list;
mod pending;
mod subscriptions;
mod transport;

pub use backoff::{BackoffTimer, RetryConfig};
pub use config::SyncConfig;
pub use database::{AutoDownload, DatabaseState, DatabaseSync, SyncRole};
pub use error::{SyncError, SyncResult};
pub use list::{ListState, LocationSync};
pub use pending::DataReadyHandle;
pub use subscriptions::IncomingSubscription;
pub use transport::{MessageSender, MockSender};
