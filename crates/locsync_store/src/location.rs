//! The shared location store.
//!
//! One `LocationStore` exists per (hashed-user, peer-location) pair and
//! backs both sync layers. It is cheap to clone; clones share the same
//! indexed tables behind one lock, so a primary-row mutation and its
//! change-log append always happen in a single critical section. A reader
//! can never observe a change row whose primary row does not yet reflect
//! that change.

use crate::entries::{EntryStore, EntryTable};
use crate::error::{StoreError, StoreResult};
use crate::records::{DatabaseChangeRecord, DatabaseRecord, Disposition, PeerLocationRecord};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Indexed table storage scoped to one peer location.
#[derive(Clone, Default)]
pub struct LocationStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
pub(crate) struct Inner {
    version_seq: u64,
    next_location_index: u64,
    locations: BTreeMap<u64, PeerLocationRecord>,
    locations_by_key: HashMap<(String, String), u64>,
    next_database_index: u64,
    databases: BTreeMap<u64, DatabaseRecord>,
    databases_by_key: HashMap<(u64, String), u64>,
    next_database_change_index: u64,
    database_changes: BTreeMap<u64, DatabaseChangeRecord>,
    /// `index_database -> (index_peer_location, permitted peer URIs)`.
    ///
    /// Rows outlive database removal so Remove change rows stay visible to
    /// the peers that could see the database; they are dropped with the
    /// owning location.
    permissions: HashMap<u64, (u64, Vec<String>)>,
    pub(crate) entry_tables: HashMap<u64, EntryTable>,
}

impl Inner {
    /// Mints the next opaque version token.
    pub(crate) fn mint_version(&mut self) -> String {
        self.version_seq += 1;
        format!("{:x}", self.version_seq)
    }
}

impl LocationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an entry-table handle scoped to one database row.
    ///
    /// The handle shares this store's tables; it is not a second storage
    /// instance.
    pub fn entry_store(&self, index_database: u64) -> EntryStore {
        EntryStore::new(self.clone(), index_database)
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    // ---- peer-location table ----

    /// Idempotent get-or-create of the row for a peer location.
    ///
    /// Refreshes `last_accessed` on every call.
    pub fn create_or_obtain(
        &self,
        peer_uri: &str,
        location_id: &str,
        now: u64,
    ) -> PeerLocationRecord {
        let mut inner = self.lock();
        let key = (peer_uri.to_string(), location_id.to_string());
        if let Some(&index) = inner.locations_by_key.get(&key) {
            let record = inner.locations.get_mut(&index).expect("indexed row");
            record.last_accessed = now;
            return record.clone();
        }
        inner.next_location_index += 1;
        let index = inner.next_location_index;
        let update_version = inner.mint_version();
        let lineage = inner.mint_version();
        let record = PeerLocationRecord {
            index,
            peer_uri: peer_uri.to_string(),
            location_id: location_id.to_string(),
            last_downloaded_version: String::new(),
            last_accessed: now,
            update_version,
            lineage,
        };
        inner.locations.insert(index, record.clone());
        inner.locations_by_key.insert(key, index);
        record
    }

    /// Returns a peer-location row by index.
    pub fn location_by_index(&self, index: u64) -> Option<PeerLocationRecord> {
        self.lock().locations.get(&index).cloned()
    }

    /// Re-mints the list-level version token for a location.
    pub fn update_location_version(&self, index: u64) -> StoreResult<String> {
        let mut inner = self.lock();
        let token = inner.mint_version();
        let record = inner
            .locations
            .get_mut(&index)
            .ok_or(StoreError::UnknownLocation(index))?;
        record.update_version = token.clone();
        Ok(token)
    }

    /// Records the cursor token last accepted from the list's remote owner.
    pub fn notify_downloaded(&self, index: u64, to_version: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let record = inner
            .locations
            .get_mut(&index)
            .ok_or(StoreError::UnknownLocation(index))?;
        record.last_downloaded_version = to_version.to_string();
        Ok(())
    }

    /// Returns a batch of locations unused since `older_than`.
    pub fn unused_locations_batch(&self, older_than: u64, limit: usize) -> Vec<PeerLocationRecord> {
        let inner = self.lock();
        inner
            .locations
            .values()
            .filter(|r| r.last_accessed < older_than)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Removes a peer location and everything it owns: database rows, the
    /// change log, permission rows, and entry tables.
    pub fn remove_location(&self, index: u64) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.locations.remove(&index) else {
            return false;
        };
        inner
            .locations_by_key
            .remove(&(record.peer_uri, record.location_id));
        let owned: Vec<u64> = inner
            .databases
            .values()
            .filter(|d| d.index_peer_location == index)
            .map(|d| d.index)
            .collect();
        for db_index in owned {
            let removed = inner.databases.remove(&db_index).expect("indexed row");
            inner
                .databases_by_key
                .remove(&(index, removed.database_id));
            inner.entry_tables.remove(&db_index);
        }
        inner
            .database_changes
            .retain(|_, c| c.index_peer_location != index);
        inner.permissions.retain(|_, (loc, _)| *loc != index);
        true
    }

    // ---- database table ----

    /// Upserts a database row by `(index_peer_location, database_id)`.
    ///
    /// Assigns the row index, keeps the original `created` stamp on update,
    /// bumps the owning location's version token, and appends the Add or
    /// Update change row, all in one critical section. The change row is
    /// returned. If the caller left `update_version` empty a fresh token is
    /// minted; a non-empty token (a remote owner's) is stored as-is.
    pub fn add_or_update_database(
        &self,
        record: &mut DatabaseRecord,
    ) -> StoreResult<DatabaseChangeRecord> {
        let mut inner = self.lock();
        if !inner.locations.contains_key(&record.index_peer_location) {
            return Err(StoreError::UnknownLocation(record.index_peer_location));
        }
        let key = (record.index_peer_location, record.database_id.clone());
        let disposition = match inner.databases_by_key.get(&key).copied() {
            Some(index) => {
                let existing = inner.databases.get(&index).expect("indexed row");
                record.index = index;
                record.lineage = existing.lineage.clone();
                if record.created == 0 {
                    record.created = existing.created;
                }
                if record.last_downloaded_version.is_empty() {
                    record.last_downloaded_version = existing.last_downloaded_version.clone();
                }
                Disposition::Update
            }
            None => {
                inner.next_database_index += 1;
                record.index = inner.next_database_index;
                record.lineage = inner.mint_version();
                Disposition::Add
            }
        };
        if record.update_version.is_empty() {
            record.update_version = inner.mint_version();
        }
        inner.databases.insert(record.index, record.clone());
        inner.databases_by_key.insert(key, record.index);
        let location_version = inner.mint_version();
        if let Some(location) = inner.locations.get_mut(&record.index_peer_location) {
            location.update_version = location_version;
        }
        Ok(Self::append_database_change(
            &mut inner,
            record.index_peer_location,
            disposition,
            record.index,
            record.database_id.clone(),
        ))
    }

    /// Removes a database row, appending the Remove change row and dropping
    /// the entry table. Permission rows are kept (see [`Inner`] notes).
    pub fn remove_database(&self, index: u64) -> Option<DatabaseChangeRecord> {
        let mut inner = self.lock();
        let record = inner.databases.remove(&index)?;
        inner
            .databases_by_key
            .remove(&(record.index_peer_location, record.database_id.clone()));
        inner.entry_tables.remove(&index);
        let location_version = inner.mint_version();
        if let Some(location) = inner.locations.get_mut(&record.index_peer_location) {
            location.update_version = location_version;
        }
        Some(Self::append_database_change(
            &mut inner,
            record.index_peer_location,
            Disposition::Remove,
            index,
            record.database_id,
        ))
    }

    /// Returns a database row by index.
    pub fn database_by_index(&self, index: u64) -> Option<DatabaseRecord> {
        self.lock().databases.get(&index).cloned()
    }

    /// Returns a database row by `(location, database_id)`.
    pub fn database_by_id(&self, index_peer_location: u64, database_id: &str) -> Option<DatabaseRecord> {
        let inner = self.lock();
        let key = (index_peer_location, database_id.to_string());
        let index = inner.databases_by_key.get(&key)?;
        inner.databases.get(index).cloned()
    }

    /// Returns databases at a location with row index greater than
    /// `after_index`, in index order.
    pub fn databases_batch(
        &self,
        index_peer_location: u64,
        after_index: u64,
        limit: usize,
    ) -> Vec<DatabaseRecord> {
        let inner = self.lock();
        inner
            .databases
            .range(after_index + 1..)
            .map(|(_, r)| r)
            .filter(|r| r.index_peer_location == index_peer_location)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Like [`databases_batch`](Self::databases_batch), restricted to rows
    /// whose permission set contains `peer_uri`. A database with no
    /// permission row is visible to no remote peer.
    pub fn databases_batch_for_peer(
        &self,
        peer_uri: &str,
        index_peer_location: u64,
        after_index: u64,
        limit: usize,
    ) -> Vec<DatabaseRecord> {
        let inner = self.lock();
        inner
            .databases
            .range(after_index + 1..)
            .map(|(_, r)| r)
            .filter(|r| r.index_peer_location == index_peer_location)
            .filter(|r| Self::permits(&inner, r.index, peer_uri))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns databases whose `expires` stamp has passed.
    pub fn expired_databases_batch(&self, now: u64, limit: usize) -> Vec<DatabaseRecord> {
        let inner = self.lock();
        inner
            .databases
            .values()
            .filter(|r| r.expires != 0 && r.expires <= now)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Records the cursor token last accepted from a database's remote owner.
    pub fn notify_database_downloaded(&self, index: u64, to_version: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let record = inner
            .databases
            .get_mut(&index)
            .ok_or(StoreError::UnknownDatabase(index))?;
        record.last_downloaded_version = to_version.to_string();
        Ok(())
    }

    /// Re-mints a database's lineage and version tokens without a change
    /// row.
    ///
    /// Every cursor minted under the old lineage degrades to a full-list
    /// sync; this is the conflict-recovery path. Returns the new lineage.
    pub fn touch_database_version(&self, index: u64) -> StoreResult<String> {
        let mut inner = self.lock();
        let lineage = inner.mint_version();
        let update_version = inner.mint_version();
        let record = inner
            .databases
            .get_mut(&index)
            .ok_or(StoreError::UnknownDatabase(index))?;
        record.lineage = lineage.clone();
        record.update_version = update_version;
        Ok(lineage)
    }

    /// Marks a database as updated: re-mints its version token, bumps the
    /// owning location's token, and appends an Update change row.
    ///
    /// Called after entry-level mutations so list subscribers learn the
    /// database moved.
    pub fn mark_database_updated(&self, index: u64) -> StoreResult<DatabaseChangeRecord> {
        let mut inner = self.lock();
        let token = inner.mint_version();
        let location_token = inner.mint_version();
        let record = inner
            .databases
            .get_mut(&index)
            .ok_or(StoreError::UnknownDatabase(index))?;
        record.update_version = token;
        let (index_peer_location, database_id) =
            (record.index_peer_location, record.database_id.clone());
        if let Some(location) = inner.locations.get_mut(&index_peer_location) {
            location.update_version = location_token;
        }
        Ok(Self::append_database_change(
            &mut inner,
            index_peer_location,
            Disposition::Update,
            index,
            database_id,
        ))
    }

    // ---- database-change table ----

    fn append_database_change(
        inner: &mut Inner,
        index_peer_location: u64,
        disposition: Disposition,
        index_database: u64,
        database_id: String,
    ) -> DatabaseChangeRecord {
        inner.next_database_change_index += 1;
        let change = DatabaseChangeRecord {
            index: inner.next_database_change_index,
            index_peer_location,
            disposition,
            index_database,
            database_id,
        };
        inner.database_changes.insert(change.index, change.clone());
        change
    }

    /// Returns change rows for a location after `after_index`, in index order.
    pub fn database_changes_batch(
        &self,
        index_peer_location: u64,
        after_index: u64,
        limit: usize,
    ) -> Vec<DatabaseChangeRecord> {
        let inner = self.lock();
        inner
            .database_changes
            .range(after_index + 1..)
            .map(|(_, c)| c)
            .filter(|c| c.index_peer_location == index_peer_location)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Like [`database_changes_batch`](Self::database_changes_batch),
    /// restricted to databases whose permission set contains `peer_uri`.
    pub fn database_changes_batch_for_peer(
        &self,
        peer_uri: &str,
        index_peer_location: u64,
        after_index: u64,
        limit: usize,
    ) -> Vec<DatabaseChangeRecord> {
        let inner = self.lock();
        inner
            .database_changes
            .range(after_index + 1..)
            .map(|(_, c)| c)
            .filter(|c| c.index_peer_location == index_peer_location)
            .filter(|c| Self::permits(&inner, c.index_database, peer_uri))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Highest change-row index assigned so far.
    pub fn last_database_change_index(&self) -> u64 {
        self.lock().next_database_change_index
    }

    /// Drops all change rows for a location.
    pub fn flush_database_changes_for_location(&self, index_peer_location: u64) {
        self.lock()
            .database_changes
            .retain(|_, c| c.index_peer_location != index_peer_location);
    }

    // ---- permission table ----

    /// Wholesale-replaces the permission set for a database.
    pub fn set_permissions(
        &self,
        index_peer_location: u64,
        index_database: u64,
        uris: &[String],
    ) {
        self.lock()
            .permissions
            .insert(index_database, (index_peer_location, uris.to_vec()));
    }

    /// Returns the peer URIs permitted to see a database.
    pub fn permissions_for_database(&self, index_database: u64) -> Vec<String> {
        self.lock()
            .permissions
            .get(&index_database)
            .map(|(_, uris)| uris.clone())
            .unwrap_or_default()
    }

    fn permits(inner: &Inner, index_database: u64, peer_uri: &str) -> bool {
        inner
            .permissions
            .get(&index_database)
            .map(|(_, uris)| uris.iter().any(|u| u == peer_uri))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_location() -> (LocationStore, u64) {
        let store = LocationStore::new();
        let location = store.create_or_obtain("peer://host/alice", "loc-1", 100);
        (store, location.index)
    }

    #[test]
    fn create_or_obtain_is_idempotent() {
        let store = LocationStore::new();
        let first = store.create_or_obtain("peer://host/alice", "loc-1", 100);
        let second = store.create_or_obtain("peer://host/alice", "loc-1", 200);
        assert_eq!(first.index, second.index);
        assert_eq!(second.last_accessed, 200);

        let other = store.create_or_obtain("peer://host/bob", "loc-1", 100);
        assert_ne!(other.index, first.index);
    }

    #[test]
    fn add_then_update_dispositions() {
        let (store, location) = store_with_location();

        let mut record = DatabaseRecord::new(location, "db1");
        let change = store.add_or_update_database(&mut record).unwrap();
        assert_eq!(change.disposition, Disposition::Add);
        assert_eq!(change.database_id, "db1");
        assert_eq!(record.index, change.index_database);
        let first_version = record.update_version.clone();
        let first_lineage = record.lineage.clone();
        assert!(!first_lineage.is_empty());

        let mut record = DatabaseRecord::new(location, "db1");
        let change = store.add_or_update_database(&mut record).unwrap();
        assert_eq!(change.disposition, Disposition::Update);
        assert_ne!(record.update_version, first_version);
        assert_eq!(record.lineage, first_lineage);
    }

    #[test]
    fn upsert_keeps_created_stamp() {
        let (store, location) = store_with_location();
        let mut record = DatabaseRecord::new(location, "db1");
        record.created = 50;
        store.add_or_update_database(&mut record).unwrap();

        let mut again = DatabaseRecord::new(location, "db1");
        store.add_or_update_database(&mut again).unwrap();
        assert_eq!(again.created, 50);
    }

    #[test]
    fn list_mutation_bumps_location_version() {
        let (store, location) = store_with_location();
        let before = store.location_by_index(location).unwrap().update_version;

        let mut record = DatabaseRecord::new(location, "db1");
        store.add_or_update_database(&mut record).unwrap();
        let after = store.location_by_index(location).unwrap().update_version;
        assert_ne!(before, after);

        store.remove_database(record.index).unwrap();
        let final_version = store.location_by_index(location).unwrap().update_version;
        assert_ne!(after, final_version);
    }

    #[test]
    fn remove_database_announces_id() {
        let (store, location) = store_with_location();
        let mut record = DatabaseRecord::new(location, "db1");
        store.add_or_update_database(&mut record).unwrap();

        let change = store.remove_database(record.index).unwrap();
        assert_eq!(change.disposition, Disposition::Remove);
        assert_eq!(change.database_id, "db1");
        assert!(store.database_by_index(record.index).is_none());
        assert!(store.remove_database(record.index).is_none());
    }

    #[test]
    fn change_batch_is_ordered_and_gapless() {
        let (store, location) = store_with_location();
        for name in ["a", "b", "c"] {
            let mut record = DatabaseRecord::new(location, name);
            store.add_or_update_database(&mut record).unwrap();
        }

        let all = store.database_changes_batch(location, 0, 100);
        let indices: Vec<u64> = all.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);

        let tail = store.database_changes_batch(location, 1, 100);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 2);
    }

    #[test]
    fn permission_filtering() {
        let (store, location) = store_with_location();
        let mut visible = DatabaseRecord::new(location, "visible");
        store.add_or_update_database(&mut visible).unwrap();
        let mut hidden = DatabaseRecord::new(location, "hidden");
        store.add_or_update_database(&mut hidden).unwrap();

        store.set_permissions(location, visible.index, &["peer://host/bob".into()]);

        let batch = store.databases_batch_for_peer("peer://host/bob", location, 0, 100);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].database_id, "visible");

        // No permission row at all: visible to no remote peer.
        let batch = store.databases_batch_for_peer("peer://host/carol", location, 0, 100);
        assert!(batch.is_empty());

        let changes = store.database_changes_batch_for_peer("peer://host/bob", location, 0, 100);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].database_id, "visible");
    }

    #[test]
    fn remove_keeps_permission_row_for_change_visibility() {
        let (store, location) = store_with_location();
        let mut record = DatabaseRecord::new(location, "db1");
        store.add_or_update_database(&mut record).unwrap();
        store.set_permissions(location, record.index, &["peer://host/bob".into()]);
        store.remove_database(record.index).unwrap();

        let changes = store.database_changes_batch_for_peer("peer://host/bob", location, 0, 100);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].disposition, Disposition::Remove);
    }

    #[test]
    fn expired_batch() {
        let (store, location) = store_with_location();
        let mut lapsing = DatabaseRecord::new(location, "lapsing");
        lapsing.expires = 500;
        store.add_or_update_database(&mut lapsing).unwrap();
        let mut forever = DatabaseRecord::new(location, "forever");
        store.add_or_update_database(&mut forever).unwrap();

        assert!(store.expired_databases_batch(499, 10).is_empty());
        let expired = store.expired_databases_batch(500, 10);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].database_id, "lapsing");
    }

    #[test]
    fn unused_locations_and_cascade_removal() {
        let store = LocationStore::new();
        let stale = store.create_or_obtain("peer://host/old", "loc-1", 100);
        store.create_or_obtain("peer://host/new", "loc-2", 900);

        let unused = store.unused_locations_batch(500, 10);
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].index, stale.index);

        let mut record = DatabaseRecord::new(stale.index, "db1");
        store.add_or_update_database(&mut record).unwrap();
        store.set_permissions(stale.index, record.index, &["peer://host/bob".into()]);

        assert!(store.remove_location(stale.index));
        assert!(store.location_by_index(stale.index).is_none());
        assert!(store.database_by_index(record.index).is_none());
        assert!(store.database_changes_batch(stale.index, 0, 10).is_empty());
        assert!(store.permissions_for_database(record.index).is_empty());
        assert!(!store.remove_location(stale.index));
    }

    #[test]
    fn location_version_can_be_minted_directly() {
        let (store, location) = store_with_location();
        let before = store.location_by_index(location).unwrap().update_version;
        let token = store.update_location_version(location).unwrap();
        assert_ne!(token, before);
        assert_eq!(
            store.location_by_index(location).unwrap().update_version,
            token
        );
        assert_eq!(
            store.update_location_version(9999),
            Err(StoreError::UnknownLocation(9999))
        );
    }

    #[test]
    fn remote_version_token_is_kept() {
        let (store, location) = store_with_location();
        let mut record = DatabaseRecord::new(location, "db1");
        record.update_version = "remote-token".into();
        store.add_or_update_database(&mut record).unwrap();
        assert_eq!(
            store.database_by_index(record.index).unwrap().update_version,
            "remote-token"
        );
    }

    #[test]
    fn touch_and_mark_updated() {
        let (store, location) = store_with_location();
        let mut record = DatabaseRecord::new(location, "db1");
        store.add_or_update_database(&mut record).unwrap();

        let touched = store.touch_database_version(record.index).unwrap();
        let reread = store.database_by_index(record.index).unwrap();
        assert_eq!(reread.lineage, touched);
        assert_ne!(reread.lineage, record.lineage);
        assert_ne!(reread.update_version, record.update_version);
        // No change row was appended by the touch.
        assert_eq!(store.database_changes_batch(location, 0, 10).len(), 1);

        let change = store.mark_database_updated(record.index).unwrap();
        assert_eq!(change.disposition, Disposition::Update);
        assert_eq!(store.database_changes_batch(location, 0, 10).len(), 2);
        // An ordinary update keeps the lineage.
        assert_eq!(
            store.database_by_index(record.index).unwrap().lineage,
            touched
        );

        assert_eq!(
            store.touch_database_version(9999),
            Err(StoreError::UnknownDatabase(9999))
        );
    }
}
