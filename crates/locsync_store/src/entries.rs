//! Entry tables: one entry table plus one entry-change table per database.
//!
//! [`EntryStore`] is a thin handle scoping the shared [`LocationStore`] to a
//! single database row, so both sync layers keep operating on the same
//! storage instance.

use crate::location::LocationStore;
use crate::records::{Disposition, EntryChangeRecord, EntryRecord};
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub(crate) struct EntryTable {
    next_index: u64,
    by_index: BTreeMap<u64, EntryRecord>,
    by_id: HashMap<String, u64>,
    next_change_index: u64,
    changes: BTreeMap<u64, EntryChangeRecord>,
}

impl EntryTable {
    fn append_change(&mut self, disposition: Disposition, entry_id: String) -> EntryChangeRecord {
        self.next_change_index += 1;
        let change = EntryChangeRecord {
            index: self.next_change_index,
            disposition,
            entry_id,
        };
        self.changes.insert(change.index, change.clone());
        change
    }
}

/// Handle over the entry tables of one database.
#[derive(Clone)]
pub struct EntryStore {
    store: LocationStore,
    index_database: u64,
}

impl EntryStore {
    pub(crate) fn new(store: LocationStore, index_database: u64) -> Self {
        Self {
            store,
            index_database,
        }
    }

    /// The database row this handle is scoped to.
    pub fn index_database(&self) -> u64 {
        self.index_database
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut EntryTable) -> R) -> R {
        let mut inner = self.store.lock();
        let table = inner.entry_tables.entry(self.index_database).or_default();
        f(table)
    }

    /// Inserts an entry, appending the Add change row in the same critical
    /// section. Returns `None` if the entry ID already exists.
    ///
    /// Assigns the row index; a zero `version` is promoted to 1.
    pub fn add(&self, record: &mut EntryRecord) -> Option<EntryChangeRecord> {
        self.with_table(|table| {
            if table.by_id.contains_key(&record.entry_id) {
                return None;
            }
            table.next_index += 1;
            record.index = table.next_index;
            if record.version == 0 {
                record.version = 1;
            }
            if let Some(data) = &record.data {
                record.data_length = data.len() as u64;
                record.data_fetched = true;
            }
            table.by_id.insert(record.entry_id.clone(), record.index);
            table.by_index.insert(record.index, record.clone());
            Some(table.append_change(Disposition::Add, record.entry_id.clone()))
        })
    }

    /// Rewrites an existing entry, appending the Update change row. Returns
    /// `None` if the entry is missing.
    ///
    /// The per-entry version stays monotonic: a caller-supplied version is
    /// kept only if it moves forward, otherwise the stored version is
    /// bumped by one. Row index and `created` stamp are preserved.
    pub fn update(&self, record: &mut EntryRecord) -> Option<EntryChangeRecord> {
        self.with_table(|table| {
            let index = *table.by_id.get(&record.entry_id)?;
            let existing = table.by_index.get(&index).expect("indexed row");
            record.index = index;
            if record.version <= existing.version {
                record.version = existing.version + 1;
            }
            if record.created == 0 {
                record.created = existing.created;
            }
            if let Some(data) = &record.data {
                record.data_length = data.len() as u64;
                record.data_fetched = true;
            }
            table.by_index.insert(index, record.clone());
            Some(table.append_change(Disposition::Update, record.entry_id.clone()))
        })
    }

    /// Deletes an entry, appending the Remove change row. Returns `None` if
    /// the entry is missing.
    pub fn remove(&self, entry_id: &str) -> Option<EntryChangeRecord> {
        self.with_table(|table| {
            let index = table.by_id.remove(entry_id)?;
            table.by_index.remove(&index);
            Some(table.append_change(Disposition::Remove, entry_id.to_string()))
        })
    }

    /// Returns entries with row index greater than `after_index`, in index
    /// order. Bodies are stripped unless `include_data` is set.
    pub fn entries_batch(
        &self,
        include_data: bool,
        after_index: u64,
        limit: usize,
    ) -> Vec<EntryRecord> {
        self.with_table(|table| {
            table
                .by_index
                .range(after_index + 1..)
                .map(|(_, r)| r)
                .take(limit)
                .map(|r| strip_data(r.clone(), include_data))
                .collect()
        })
    }

    /// Returns one entry by ID. Bodies are stripped unless `include_data`
    /// is set.
    pub fn entry(&self, entry_id: &str, include_data: bool) -> Option<EntryRecord> {
        self.with_table(|table| {
            let index = *table.by_id.get(entry_id)?;
            let record = table.by_index.get(&index).expect("indexed row");
            Some(strip_data(record.clone(), include_data))
        })
    }

    /// Completes a lazy fetch: stores the body and marks it fetched.
    ///
    /// The entry itself did not change, so no change row is appended and
    /// the entry version is untouched. Returns false if the entry is
    /// missing.
    pub fn set_entry_data(&self, entry_id: &str, data: Vec<u8>) -> bool {
        self.with_table(|table| {
            let Some(&index) = table.by_id.get(entry_id) else {
                return false;
            };
            let record = table.by_index.get_mut(&index).expect("indexed row");
            record.data_length = data.len() as u64;
            record.data = Some(data);
            record.data_fetched = true;
            true
        })
    }

    /// Returns IDs of entries whose body still has to be retrieved.
    pub fn unfetched_entry_ids(&self, limit: usize) -> Vec<String> {
        self.with_table(|table| {
            table
                .by_index
                .values()
                .filter(|r| !r.data_fetched)
                .map(|r| r.entry_id.clone())
                .take(limit)
                .collect()
        })
    }

    /// Returns change rows after `after_index`, in index order.
    pub fn changes_batch(&self, after_index: u64, limit: usize) -> Vec<EntryChangeRecord> {
        self.with_table(|table| {
            table
                .changes
                .range(after_index + 1..)
                .map(|(_, c)| c)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    /// Highest change-row index assigned so far.
    pub fn last_change_index(&self) -> u64 {
        self.with_table(|table| table.next_change_index)
    }
}

fn strip_data(mut record: EntryRecord, include_data: bool) -> EntryRecord {
    if !include_data {
        record.data = None;
    }
    record
}
