//! Protocol message records.
//!
//! The engine produces and consumes these as typed records; encoding them
//! for the wire is the transport fabric's concern, hence the serde derives
//! and the absence of any byte-level codec here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlates an outgoing request with its asynchronous response or
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req:{}", self.0)
    }
}

/// Add/Update/Remove tag on a change announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// The item is new to the subscriber.
    Add,
    /// The item changed.
    Update,
    /// The item is gone.
    Remove,
}

/// One database announced in a list payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// What happened to the database.
    pub disposition: Disposition,
    /// Database identifier, unique within the location.
    pub database_id: String,
    /// The owner's version token for this database; empty on Remove.
    pub version: String,
    /// Opaque structured metadata blob.
    pub metadata: Option<String>,
    /// Epoch seconds of creation at the owner; 0 if unknown.
    pub created: u64,
    /// Epoch seconds after which the database lapses; 0 means never.
    pub expires: u64,
}

impl DatabaseInfo {
    /// An announcement that a database is gone.
    pub fn removed(database_id: impl Into<String>) -> Self {
        Self {
            disposition: Disposition::Remove,
            database_id: database_id.into(),
            version: String::new(),
            metadata: None,
            created: 0,
            expires: 0,
        }
    }
}

/// One entry announced in a database payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// What happened to the entry.
    pub disposition: Disposition,
    /// Entry identifier, unique within the database.
    pub entry_id: String,
    /// Monotonic per-entry version; 0 on Remove.
    pub version: u64,
    /// Opaque structured metadata blob.
    pub metadata: Option<String>,
    /// Entry body, present only when the sender chose to inline it.
    pub data: Option<Vec<u8>>,
    /// Declared body length, valid even while `data` is absent.
    pub data_length: u64,
    /// Epoch seconds of creation.
    pub created: u64,
    /// Epoch seconds of last update.
    pub updated: u64,
}

impl EntryInfo {
    /// An announcement that an entry is gone.
    pub fn removed(entry_id: impl Into<String>) -> Self {
        Self {
            disposition: Disposition::Remove,
            entry_id: entry_id.into(),
            version: 0,
            metadata: None,
            data: None,
            data_length: 0,
            created: 0,
            updated: 0,
        }
    }
}

/// Subscribes to (or, with `expires == 0`, unsubscribes from) the list of
/// databases at a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSubscribeRequest {
    /// Cursor token from the last accepted payload; empty for a fresh
    /// subscription.
    pub version: String,
    /// Requested subscription expiry, epoch seconds; 0 cancels.
    pub expires: u64,
}

/// Answers a list subscribe with the initial delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSubscribeResult {
    /// Databases added/updated/removed since the presented cursor.
    pub databases: Vec<DatabaseInfo>,
    /// New cursor token to present next time.
    pub version: String,
    /// Granted subscription expiry, epoch seconds.
    pub expires: u64,
}

/// Pushes a list delta to a standing subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSubscribeNotify {
    /// Databases added/updated/removed since the subscriber's cursor.
    pub databases: Vec<DatabaseInfo>,
    /// New cursor token to present next time.
    pub version: String,
}

/// Subscribes to (or, with `expires == 0`, unsubscribes from) one
/// database's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Target database.
    pub database_id: String,
    /// Cursor token from the last accepted payload; empty for a fresh
    /// subscription.
    pub version: String,
    /// Requested subscription expiry, epoch seconds; 0 cancels.
    pub expires: u64,
}

/// Answers a database subscribe with the initial delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResult {
    /// Entries added/updated/removed since the presented cursor.
    pub entries: Vec<EntryInfo>,
    /// New cursor token to present next time.
    pub version: String,
    /// Granted subscription expiry, epoch seconds.
    pub expires: u64,
}

/// Pushes an entry delta to a standing subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeNotify {
    /// Target database.
    pub database_id: String,
    /// Entries added/updated/removed since the subscriber's cursor.
    pub entries: Vec<EntryInfo>,
    /// New cursor token to present next time.
    pub version: String,
}

/// Requests entry bodies by ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGetRequest {
    /// Target database.
    pub database_id: String,
    /// Entries whose bodies are wanted.
    pub entry_ids: Vec<String>,
}

/// Per-entry failure detail in a [`DataGetResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    /// The entry that could not be resolved.
    pub entry_id: String,
    /// Why.
    pub reason: String,
}

/// Answers a data-get with bodies for every entry that could be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGetResult {
    /// Resolved entries, bodies inlined.
    pub entries: Vec<EntryInfo>,
    /// Entries that could not be resolved.
    pub errors: Vec<EntryError>,
}

/// An outgoing request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    /// List-level subscribe.
    ListSubscribe(ListSubscribeRequest),
    /// Database-level subscribe.
    Subscribe(SubscribeRequest),
    /// Entry body fetch.
    DataGet(DataGetRequest),
}

/// A response envelope, delivered against the request's [`RequestId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteResponse {
    /// Answer to a list-level subscribe.
    ListSubscribe(ListSubscribeResult),
    /// Answer to a database-level subscribe.
    Subscribe(SubscribeResult),
    /// Answer to an entry body fetch.
    DataGet(DataGetResult),
}

/// An unsolicited push envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteNotify {
    /// List delta push.
    List(ListSubscribeNotify),
    /// Entry delta push.
    Database(SubscribeNotify),
}
