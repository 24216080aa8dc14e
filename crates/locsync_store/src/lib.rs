//! # locsync store
//!
//! Indexed table storage for peer-location database sync.
//!
//! This crate provides the six logical tables behind the sync engine:
//! peer-location, database, database-change, permission, entry, and
//! entry-change. One [`LocationStore`] exists per (hashed-user,
//! peer-location) pair and is shared by both sync layers; [`EntryStore`]
//! scopes the same instance to one database.
//!
//! ## Key invariants
//!
//! - Row indices are strictly monotonic per table and never reused.
//! - Every primary-table mutation appends its change-log row in the same
//!   call, inside one critical section — readers never observe a change
//!   row ahead of its primary row.
//! - Queries take `after_index` cursors, never timestamps, so clock skew
//!   between peers cannot affect convergence.
//!
//! The SQL-like physical engine this abstraction would normally sit on is
//! an external collaborator; this crate ships the indexed in-memory
//! implementation of the contract.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entries;
mod error;
mod location;
mod records;

pub use entries::EntryStore;
pub use error::{StoreError, StoreResult};
pub use location::LocationStore;
pub use records::{
    DatabaseChangeRecord, DatabaseRecord, Disposition, EntryChangeRecord, EntryRecord,
    PeerLocationRecord,
};
