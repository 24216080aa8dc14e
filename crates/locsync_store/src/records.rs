//! Record types for the six location-sync tables.
//!
//! All indices are `u64`, assigned from 1, strictly monotonic per table.
//! An `after_index` of 0 means "from the beginning". Timestamps are epoch
//! seconds; the store never reads a wall clock, callers pass `now` in.

/// How a change-log row altered its primary table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// A row was inserted.
    Add,
    /// An existing row was rewritten.
    Update,
    /// A row was deleted.
    Remove,
}

/// One row per remote peer location ever observed.
///
/// Created on first contact; `last_accessed` is refreshed on use so unused
/// locations can be garbage collected in batches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerLocationRecord {
    /// Row index.
    pub index: u64,
    /// Peer URI of the remote party.
    pub peer_uri: String,
    /// Location identifier within the peer.
    pub location_id: String,
    /// List-level download watermark (cursor token last accepted from the owner).
    pub last_downloaded_version: String,
    /// Epoch seconds of last use.
    pub last_accessed: u64,
    /// Opaque version token, re-minted on every list mutation. Subscriber
    /// notifications coalesce against it.
    pub update_version: String,
    /// Opaque identity token cursors are minted under; assigned at
    /// creation and stable for the row's lifetime. A cursor whose lineage
    /// no longer matches cannot be resumed.
    pub lineage: String,
}

/// One row per database known at a peer location.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseRecord {
    /// Row index.
    pub index: u64,
    /// Owning peer-location row.
    pub index_peer_location: u64,
    /// Database identifier, unique within the location.
    pub database_id: String,
    /// Entry-level download watermark (cursor token last accepted from the owner).
    pub last_downloaded_version: String,
    /// Opaque structured metadata blob.
    pub meta_data: Option<String>,
    /// Epoch seconds of creation at the owner.
    pub created: u64,
    /// Epoch seconds after which the database lapses; 0 means never.
    pub expires: u64,
    /// Opaque version token, re-minted on every mutation of this database.
    /// Subscriber notifications coalesce against it.
    ///
    /// When the local node syncs a remote owner's record it stores the
    /// owner's token here; for locally owned databases the store mints one.
    pub update_version: String,
    /// Opaque identity token cursors are minted under; re-minted only when
    /// history stops being continuable — at creation and on conflict.
    pub lineage: String,
}

impl DatabaseRecord {
    /// Creates a record for upserting into the database table.
    pub fn new(index_peer_location: u64, database_id: impl Into<String>) -> Self {
        Self {
            index_peer_location,
            database_id: database_id.into(),
            ..Self::default()
        }
    }
}

/// Append-only change-log row for the database table.
///
/// Carries the `database_id` alongside the row index so a Remove stays
/// announceable after the primary row is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseChangeRecord {
    /// Row index.
    pub index: u64,
    /// Owning peer-location row.
    pub index_peer_location: u64,
    /// What happened to the database row.
    pub disposition: Disposition,
    /// Index of the affected database row.
    pub index_database: u64,
    /// Identifier of the affected database.
    pub database_id: String,
}

/// One row per entry in a database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryRecord {
    /// Row index.
    pub index: u64,
    /// Entry identifier, unique within the database.
    pub entry_id: String,
    /// Monotonic per-entry version, bumped on every update.
    pub version: u64,
    /// Opaque structured metadata blob.
    pub meta_data: Option<String>,
    /// Entry body; absent until fetched.
    pub data: Option<Vec<u8>>,
    /// Declared body length, valid even while `data` is absent.
    pub data_length: u64,
    /// False while the body still has to be lazily retrieved.
    pub data_fetched: bool,
    /// Epoch seconds of creation.
    pub created: u64,
    /// Epoch seconds of last update.
    pub updated: u64,
}

impl EntryRecord {
    /// Creates a record for inserting into an entry table.
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            ..Self::default()
        }
    }

    /// Attaches a body, marking it fetched.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data_length = data.len() as u64;
        self.data = Some(data);
        self.data_fetched = true;
        self
    }
}

/// Append-only change-log row for an entry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChangeRecord {
    /// Row index.
    pub index: u64,
    /// What happened to the entry row.
    pub disposition: Disposition,
    /// Identifier of the affected entry.
    pub entry_id: String,
}
