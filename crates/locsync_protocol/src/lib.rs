//! # locsync protocol
//!
//! Protocol message records and cursor tokens for peer-location database
//! sync.
//!
//! This crate provides:
//! - The list-subscribe, database-subscribe, and data-get message families
//! - `DatabaseInfo`/`EntryInfo` change announcements with dispositions
//! - Versioned cursor tokens (`SyncCursor`)
//! - Request/response/notify envelopes and request correlation
//!
//! This is a pure data crate with no I/O; the transport fabric owns the
//! wire encoding.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod messages;

pub use cursor::{CursorKind, SyncCursor};
pub use messages::{
    DataGetRequest, DataGetResult, DatabaseInfo, Disposition, EntryError, EntryInfo,
    ListSubscribeNotify, ListSubscribeRequest, ListSubscribeResult, RemoteNotify, RemoteRequest,
    RemoteResponse, RequestId, SubscribeNotify, SubscribeRequest, SubscribeResult,
};
