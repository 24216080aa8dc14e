//! The per-database synchronizer.
//!
//! One `DatabaseSync` exists per (peer-location, database) pair, owned by
//! the location's [`LocationSync`](crate::LocationSync). A remote-role
//! instance drives the outgoing subscribe/data-get protocol against the
//! owner; a local-role instance authors entries and serves incoming
//! subscribers. Every `step_*` method is idempotent and a no-op while its
//! preconditions are unmet, so the step driver can re-run the whole fixed
//! order on any input change.

use crate::backoff::BackoffTimer;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::pending::{DataReadyHandle, PendingEntryMap, PendingKind, PendingRequests};
use crate::subscriptions::SubscriptionSet;
use crate::transport::MessageSender;
use locsync_protocol::{
    CursorKind, DataGetRequest, DataGetResult, Disposition, EntryError, EntryInfo, RemoteNotify,
    RemoteRequest, SubscribeNotify, SubscribeRequest, SubscribeResult, SyncCursor,
};
use locsync_store::{Disposition as StoreDisposition, EntryRecord, EntryStore, LocationStore};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which side of the protocol a synchronizer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// This node is authoritative: author mutations, serve subscribers.
    Local,
    /// A remote peer is authoritative: subscribe and replicate.
    Remote,
}

/// Lifecycle of a database synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    /// Waiting for the first successful subscribe exchange.
    Pending,
    /// Synchronizing.
    Ready,
    /// Teardown requested; the next step completes it.
    ShuttingDown,
    /// Torn down; the owner prunes the instance.
    Shutdown,
}

/// Whether entry bodies are fetched eagerly or on demand.
///
/// Fixed at open time; changing it requires closing and reopening the
/// synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDownload {
    /// Fetch every body as soon as the entry is known.
    All,
    /// Fetch bodies only when a caller registers interest.
    OnDemand,
}

/// Synchronizer for one database at one peer location.
pub struct DatabaseSync {
    database_id: String,
    database_index: u64,
    role: SyncRole,
    state: DatabaseState,
    conflict: bool,
    auto_download: AutoDownload,
    store: LocationStore,
    entries: EntryStore,
    sender: Arc<dyn MessageSender>,
    config: SyncConfig,
    /// In-memory mirror of the persisted download watermark.
    cursor: String,
    subscribe_in_flight: Option<locsync_protocol::RequestId>,
    subscribe_established: bool,
    subscribe_expires: u64,
    backoff: BackoffTimer,
    data_get_in_flight: Option<locsync_protocol::RequestId>,
    data_backoff: BackoffTimer,
    waiters: PendingEntryMap,
    incoming: SubscriptionSet,
}

impl DatabaseSync {
    pub(crate) fn open_local(
        database_id: String,
        database_index: u64,
        store: LocationStore,
        sender: Arc<dyn MessageSender>,
        config: SyncConfig,
    ) -> Self {
        Self::open(
            database_id,
            database_index,
            SyncRole::Local,
            AutoDownload::OnDemand,
            store,
            sender,
            config,
        )
    }

    pub(crate) fn open_remote(
        database_id: String,
        database_index: u64,
        auto_download: AutoDownload,
        store: LocationStore,
        sender: Arc<dyn MessageSender>,
        config: SyncConfig,
    ) -> Self {
        Self::open(
            database_id,
            database_index,
            SyncRole::Remote,
            auto_download,
            store,
            sender,
            config,
        )
    }

    fn open(
        database_id: String,
        database_index: u64,
        role: SyncRole,
        auto_download: AutoDownload,
        store: LocationStore,
        sender: Arc<dyn MessageSender>,
        config: SyncConfig,
    ) -> Self {
        let cursor = store
            .database_by_index(database_index)
            .map(|r| r.last_downloaded_version)
            .unwrap_or_default();
        let entries = store.entry_store(database_index);
        let retry = config.retry.clone();
        Self {
            database_id,
            database_index,
            role,
            state: match role {
                SyncRole::Local => DatabaseState::Ready,
                SyncRole::Remote => DatabaseState::Pending,
            },
            conflict: false,
            auto_download,
            store,
            entries,
            sender,
            config,
            cursor,
            subscribe_in_flight: None,
            subscribe_established: false,
            subscribe_expires: 0,
            backoff: BackoffTimer::new(retry.clone()),
            data_get_in_flight: None,
            data_backoff: BackoffTimer::new(retry),
            waiters: PendingEntryMap::new(),
            incoming: SubscriptionSet::new(),
        }
    }

    /// The database this synchronizer is bound to.
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Which side of the protocol this synchronizer plays.
    pub fn role(&self) -> SyncRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DatabaseState {
        self.state
    }

    /// The body-download policy fixed at open time.
    pub fn auto_download(&self) -> AutoDownload {
        self.auto_download
    }

    // ---- local authoring ----

    /// Inserts an entry into a locally owned database.
    ///
    /// Appends the entry-change row in the same storage operation and
    /// marks the database updated so subscribers are notified on the next
    /// step. Returns false if this database is not locally owned, is
    /// shutting down, or the entry ID already exists.
    pub fn add(
        &mut self,
        entry_id: &str,
        metadata: Option<String>,
        data: Option<Vec<u8>>,
        now: u64,
    ) -> bool {
        if !self.can_author() {
            return false;
        }
        let mut record = EntryRecord::new(entry_id);
        record.meta_data = metadata;
        if let Some(data) = data {
            record = record.with_data(data);
        }
        record.created = now;
        record.updated = now;
        if self.entries.add(&mut record).is_none() {
            return false;
        }
        self.mark_updated();
        true
    }

    /// Rewrites an entry in a locally owned database. Returns false if the
    /// entry is missing or this database cannot be authored.
    pub fn update(
        &mut self,
        entry_id: &str,
        metadata: Option<String>,
        data: Option<Vec<u8>>,
        now: u64,
    ) -> bool {
        if !self.can_author() {
            return false;
        }
        let mut record = EntryRecord::new(entry_id);
        record.meta_data = metadata;
        if let Some(data) = data {
            record = record.with_data(data);
        }
        record.updated = now;
        if self.entries.update(&mut record).is_none() {
            return false;
        }
        self.mark_updated();
        true
    }

    /// Deletes an entry from a locally owned database. Returns false if
    /// the entry is missing or this database cannot be authored.
    pub fn remove(&mut self, entry_id: &str, _now: u64) -> bool {
        if !self.can_author() {
            return false;
        }
        if self.entries.remove(entry_id).is_none() {
            return false;
        }
        self.mark_updated();
        true
    }

    fn can_author(&self) -> bool {
        self.role == SyncRole::Local
            && !matches!(
                self.state,
                DatabaseState::ShuttingDown | DatabaseState::Shutdown
            )
    }

    fn mark_updated(&mut self) {
        if let Err(error) = self.store.mark_database_updated(self.database_index) {
            warn!(database_id = %self.database_id, %error, "could not mark database updated");
        }
    }

    // ---- update computation ----

    /// Computes the delta a subscriber at `existing_version` must apply,
    /// plus the cursor token to present next time.
    ///
    /// An absent, unparseable, or lineage-mismatched cursor — including
    /// every cursor minted before the last conflict — yields the full
    /// entry list; otherwise the change log drives an incremental diff.
    /// Bodies are never inlined; subscribers fetch them via data-get.
    pub fn get_updates(&self, existing_version: &str) -> (Vec<EntryInfo>, String) {
        let version = self.lineage();
        let cursor = SyncCursor::resume(existing_version, &version);
        match cursor.kind {
            CursorKind::FullList => {
                let after = self.entries.last_change_index();
                let infos = self
                    .entries
                    .entries_batch(false, 0, usize::MAX)
                    .into_iter()
                    .map(|r| entry_info(Disposition::Add, &r))
                    .collect();
                (infos, SyncCursor::full_after(after).token(&version))
            }
            CursorKind::ChangeList => {
                let changes = self
                    .entries
                    .changes_batch(cursor.after_index, self.config.entry_batch);
                let after = changes.last().map(|c| c.index).unwrap_or(cursor.after_index);
                let mut infos = Vec::with_capacity(changes.len());
                for change in changes {
                    match change.disposition {
                        StoreDisposition::Remove => {
                            infos.push(EntryInfo::removed(change.entry_id));
                        }
                        disposition => {
                            // A row whose entry is already gone is covered
                            // by the Remove row that follows it.
                            if let Some(record) = self.entries.entry(&change.entry_id, false) {
                                infos.push(entry_info(proto_disposition(disposition), &record));
                            }
                        }
                    }
                }
                (infos, SyncCursor::changes_after(after).token(&version))
            }
        }
    }

    /// The per-mutation version token notifications coalesce against.
    fn current_version(&self) -> String {
        self.store
            .database_by_index(self.database_index)
            .map(|r| r.update_version)
            .unwrap_or_default()
    }

    /// The identity token cursors are minted under.
    fn lineage(&self) -> String {
        self.store
            .database_by_index(self.database_index)
            .map(|r| r.lineage)
            .unwrap_or_default()
    }

    // ---- conflict ----

    /// Raises the conflict flag: the database's identity or version
    /// diverged and cached cursors are no longer trustworthy.
    ///
    /// Discards the download watermark and re-mints the local lineage, so
    /// the next outgoing subscribe and every incoming `get_updates` fall
    /// back to a full-list sync.
    pub fn notify_conflict(&mut self) {
        debug!(database_id = %self.database_id, "conflict raised, forcing full resync");
        self.conflict = true;
        self.cursor.clear();
        let _ = self
            .store
            .notify_database_downloaded(self.database_index, "");
        if let Err(error) = self.store.touch_database_version(self.database_index) {
            warn!(database_id = %self.database_id, %error, "could not re-mint lineage");
        }
    }

    /// Called by the list layer when an announcement shows the owner's
    /// version moved; wakes the subscribe step so the delta is polled
    /// ahead of the renewal deadline.
    pub(crate) fn notify_remote_changed(&mut self) {
        self.subscribe_established = false;
        self.subscribe_expires = 0;
    }

    // ---- lazy fetch ----

    /// Registers interest in entry bodies.
    ///
    /// The handle settles Ok once every named entry has its body locally;
    /// bodies already present settle it immediately. It rejects when the
    /// data backoff exhausts its attempts or the synchronizer shuts down.
    pub fn notify_when_data_ready(&mut self, entry_ids: &[String]) -> DataReadyHandle {
        let remaining: BTreeSet<String> = entry_ids
            .iter()
            .filter(|id| {
                self.entries
                    .entry(id.as_str(), false)
                    .map(|r| !r.data_fetched)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !remaining.is_empty()
            && matches!(
                self.state,
                DatabaseState::ShuttingDown | DatabaseState::Shutdown
            )
        {
            let mut scratch = PendingEntryMap::new();
            let handle = scratch.register(remaining);
            scratch.reject_all(SyncError::Cancelled);
            return handle;
        }
        self.waiters.register(remaining)
    }

    // ---- step driver ----

    /// Re-evaluates every sub-step in fixed order.
    ///
    /// Safe to call on any input change; sub-steps whose preconditions are
    /// unmet do nothing.
    pub(crate) fn step(&mut self, now: u64, pending: &mut PendingRequests) {
        match self.state {
            DatabaseState::Shutdown => return,
            DatabaseState::ShuttingDown => {
                self.step_shutdown(pending);
                return;
            }
            DatabaseState::Pending | DatabaseState::Ready => {}
        }
        self.step_conflict();
        match self.role {
            SyncRole::Remote => {
                self.step_remote_subscribe(now, pending);
                self.step_remote_download_pending_requested_data(now, pending);
                self.step_remote_automatic_download_all_data(now, pending);
            }
            SyncRole::Local => {
                self.step_local_incoming_timer(now);
                self.step_local_incoming_notify(now);
            }
        }
    }

    fn step_conflict(&mut self) {
        if !self.conflict {
            return;
        }
        self.conflict = false;
        self.subscribe_established = false;
        self.subscribe_expires = 0;
    }

    fn step_remote_subscribe(&mut self, now: u64, pending: &mut PendingRequests) {
        if self.subscribe_in_flight.is_some() || self.backoff.blocks(now) {
            return;
        }
        let renew_at = self
            .subscribe_expires
            .saturating_sub(self.config.resubscribe_margin.as_secs());
        if self.subscribe_established && now < renew_at {
            return;
        }
        let request = SubscribeRequest {
            database_id: self.database_id.clone(),
            version: self.cursor.clone(),
            expires: now + self.config.subscription_ttl.as_secs(),
        };
        let id = pending.issue(PendingKind::Subscribe {
            database_id: self.database_id.clone(),
        });
        self.subscribe_in_flight = Some(id);
        self.sender.send_request(id, RemoteRequest::Subscribe(request));
    }

    fn step_local_incoming_timer(&mut self, now: u64) {
        let evicted = self.incoming.sweep_expired(now);
        if evicted > 0 {
            debug!(database_id = %self.database_id, evicted, "expired incoming subscriptions");
        }
    }

    fn step_local_incoming_notify(&mut self, _now: u64) {
        let current = self.current_version();
        for peer_uri in self.incoming.stale_peers(&current) {
            let Some(cursor) = self.incoming.get_mut(&peer_uri).map(|s| s.cursor.clone()) else {
                continue;
            };
            let (entries, version) = self.get_updates(&cursor);
            let complete = self.delta_complete(&entries, &version);
            if !entries.is_empty() {
                self.sender.send_notify(
                    &peer_uri,
                    RemoteNotify::Database(SubscribeNotify {
                        database_id: self.database_id.clone(),
                        entries,
                        version: version.clone(),
                    }),
                );
            }
            if let Some(subscription) = self.incoming.get_mut(&peer_uri) {
                subscription.cursor = version;
                if complete {
                    subscription.notified_version = current.clone();
                }
            }
        }
    }

    fn delta_complete(&self, entries: &[EntryInfo], version: &str) -> bool {
        match SyncCursor::parse(version) {
            Some((_, cursor)) if cursor.kind == CursorKind::FullList => true,
            _ => entries.len() < self.config.entry_batch,
        }
    }

    fn step_remote_download_pending_requested_data(
        &mut self,
        now: u64,
        pending: &mut PendingRequests,
    ) {
        if self.data_get_in_flight.is_some() || self.data_backoff.blocks(now) {
            return;
        }
        let mut wanted = Vec::new();
        for entry_id in self.waiters.wanted() {
            match self.entries.entry(&entry_id, false) {
                Some(record) if record.data_fetched => self.waiters.satisfy(&entry_id),
                // Entries not yet synced are still asked for; the owner
                // may already have them.
                _ => wanted.push(entry_id),
            }
            if wanted.len() == self.config.data_batch {
                break;
            }
        }
        if !wanted.is_empty() {
            self.send_data_get(wanted, pending);
        }
    }

    fn step_remote_automatic_download_all_data(&mut self, now: u64, pending: &mut PendingRequests) {
        if self.auto_download != AutoDownload::All {
            return;
        }
        if self.data_get_in_flight.is_some() || self.data_backoff.blocks(now) {
            return;
        }
        let wanted = self.entries.unfetched_entry_ids(self.config.data_batch);
        if !wanted.is_empty() {
            self.send_data_get(wanted, pending);
        }
    }

    fn send_data_get(&mut self, entry_ids: Vec<String>, pending: &mut PendingRequests) {
        let id = pending.issue(PendingKind::DataGet {
            database_id: self.database_id.clone(),
            entry_ids: entry_ids.clone(),
        });
        self.data_get_in_flight = Some(id);
        self.sender.send_request(
            id,
            RemoteRequest::DataGet(DataGetRequest {
                database_id: self.database_id.clone(),
                entry_ids,
            }),
        );
    }

    // ---- outgoing protocol handlers ----

    pub(crate) fn handle_subscribe_result(&mut self, result: SubscribeResult, now: u64) {
        self.subscribe_in_flight = None;
        self.backoff.notify_success();
        self.subscribe_established = true;
        self.subscribe_expires = if result.expires != 0 {
            result.expires
        } else {
            now + self.config.subscription_ttl.as_secs()
        };
        self.apply_entry_payload(&result.entries, &result.version, now);
        if self.state == DatabaseState::Pending {
            self.state = DatabaseState::Ready;
        }
    }

    pub(crate) fn handle_subscribe_notify(&mut self, notify: SubscribeNotify, now: u64) {
        // A push is evidence of a standing subscription; restart the
        // renewal cycle.
        self.backoff.notify_success();
        self.subscribe_established = true;
        self.subscribe_expires = now + self.config.subscription_ttl.as_secs();
        self.apply_entry_payload(&notify.entries, &notify.version, now);
        if self.state == DatabaseState::Pending {
            self.state = DatabaseState::Ready;
        }
    }

    pub(crate) fn handle_subscribe_timeout(&mut self, now: u64) {
        debug!(database_id = %self.database_id, "subscribe timed out, backing off");
        self.subscribe_in_flight = None;
        self.backoff.notify_failure(now);
    }

    pub(crate) fn handle_data_get_result(
        &mut self,
        result: DataGetResult,
        requested: Vec<String>,
        now: u64,
    ) {
        self.data_get_in_flight = None;
        let mut resolved: HashSet<String> = HashSet::new();
        for info in &result.entries {
            let Some(data) = &info.data else { continue };
            if !self.entries.set_entry_data(&info.entry_id, data.clone()) {
                // Body arrived ahead of the entry's announcement.
                let mut record = entry_record(info, now);
                record.data = Some(data.clone());
                self.entries.add(&mut record);
            }
            resolved.insert(info.entry_id.clone());
            self.waiters.satisfy(&info.entry_id);
        }
        let failed: Vec<String> = requested
            .into_iter()
            .filter(|id| !resolved.contains(id))
            .collect();
        if failed.is_empty() {
            self.data_backoff.notify_success();
        } else {
            self.data_backoff.notify_failure(now);
            if self.data_backoff.exhausted() {
                warn!(
                    database_id = %self.database_id,
                    failed = failed.len(),
                    "entry bodies unavailable after all attempts"
                );
                self.waiters.reject_waiting_on(
                    &failed,
                    SyncError::DataUnavailable {
                        database_id: self.database_id.clone(),
                    },
                );
            }
        }
    }

    pub(crate) fn handle_data_get_timeout(&mut self, requested: Vec<String>, now: u64) {
        self.data_get_in_flight = None;
        self.data_backoff.notify_failure(now);
        if self.data_backoff.exhausted() {
            self.waiters.reject_waiting_on(
                &requested,
                SyncError::DataUnavailable {
                    database_id: self.database_id.clone(),
                },
            );
        }
    }

    fn apply_entry_payload(&mut self, entries: &[EntryInfo], version_token: &str, now: u64) {
        let full = matches!(
            SyncCursor::parse(version_token),
            Some((_, cursor)) if cursor.kind == CursorKind::FullList
        );
        if full {
            let keep: HashSet<&str> = entries
                .iter()
                .filter(|i| i.disposition != Disposition::Remove)
                .map(|i| i.entry_id.as_str())
                .collect();
            for existing in self.entries.entries_batch(false, 0, usize::MAX) {
                if !keep.contains(existing.entry_id.as_str()) {
                    self.entries.remove(&existing.entry_id);
                }
            }
        }
        for info in entries {
            match info.disposition {
                Disposition::Remove => {
                    self.entries.remove(&info.entry_id);
                }
                Disposition::Add | Disposition::Update => self.apply_entry_info(info, now),
            }
        }
        self.cursor = version_token.to_string();
        let _ = self
            .store
            .notify_database_downloaded(self.database_index, version_token);
        for entry_id in self.waiters.wanted() {
            if let Some(record) = self.entries.entry(&entry_id, false) {
                if record.data_fetched {
                    self.waiters.satisfy(&entry_id);
                }
            }
        }
    }

    fn apply_entry_info(&mut self, info: &EntryInfo, now: u64) {
        match self.entries.entry(&info.entry_id, false) {
            Some(existing) => {
                // Only forward versions; replays and reorders are dropped.
                if info.version <= existing.version {
                    return;
                }
                let mut record = entry_record(info, now);
                if record.created == 0 {
                    record.created = existing.created;
                }
                self.entries.update(&mut record);
            }
            None => {
                let mut record = entry_record(info, now);
                self.entries.add(&mut record);
            }
        }
    }

    // ---- incoming service (local role) ----

    pub(crate) fn handle_subscribe_request(
        &mut self,
        from: &str,
        request: &SubscribeRequest,
        now: u64,
    ) -> SubscribeResult {
        if self.role != SyncRole::Local
            || matches!(
                self.state,
                DatabaseState::ShuttingDown | DatabaseState::Shutdown
            )
        {
            return SubscribeResult {
                entries: Vec::new(),
                version: String::new(),
                expires: 0,
            };
        }
        if request.expires == 0 {
            self.incoming.remove(from);
            return SubscribeResult {
                entries: Vec::new(),
                version: String::new(),
                expires: 0,
            };
        }
        let granted = request
            .expires
            .min(now + self.config.incoming_ttl_cap.as_secs());
        let (entries, version) = self.get_updates(&request.version);
        let complete = self.delta_complete(&entries, &version);
        let current = self.current_version();
        let subscription = self.incoming.upsert(from, granted);
        subscription.cursor = version.clone();
        if complete {
            subscription.notified_version = current;
        }
        SubscribeResult {
            entries,
            version,
            expires: granted,
        }
    }

    pub(crate) fn handle_data_get_request(&self, request: &DataGetRequest) -> DataGetResult {
        if self.role != SyncRole::Local {
            return DataGetResult {
                entries: Vec::new(),
                errors: Vec::new(),
            };
        }
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for entry_id in &request.entry_ids {
            match self.entries.entry(entry_id, true) {
                Some(record) if record.data.is_some() => {
                    let mut info = entry_info(Disposition::Add, &record);
                    info.data = record.data;
                    entries.push(info);
                }
                _ => errors.push(EntryError {
                    entry_id: entry_id.clone(),
                    reason: "not found".into(),
                }),
            }
        }
        DataGetResult { entries, errors }
    }

    // ---- shutdown ----

    /// Requests teardown; the next step completes it.
    pub(crate) fn start_shutdown(&mut self) {
        if self.state != DatabaseState::Shutdown {
            self.state = DatabaseState::ShuttingDown;
        }
    }

    fn step_shutdown(&mut self, pending: &mut PendingRequests) {
        if self.role == SyncRole::Remote && self.subscribe_established {
            // Fire-and-forget unsubscribe; no response is expected.
            let id = pending.issue_untracked();
            self.sender.send_request(
                id,
                RemoteRequest::Subscribe(SubscribeRequest {
                    database_id: self.database_id.clone(),
                    version: String::new(),
                    expires: 0,
                }),
            );
            self.subscribe_established = false;
        }
        self.subscribe_in_flight = None;
        self.data_get_in_flight = None;
        self.waiters.reject_all(SyncError::Cancelled);
        self.incoming.clear();
        self.state = DatabaseState::Shutdown;
    }
}

fn proto_disposition(disposition: StoreDisposition) -> Disposition {
    match disposition {
        StoreDisposition::Add => Disposition::Add,
        StoreDisposition::Update => Disposition::Update,
        StoreDisposition::Remove => Disposition::Remove,
    }
}

fn entry_info(disposition: Disposition, record: &EntryRecord) -> EntryInfo {
    EntryInfo {
        disposition,
        entry_id: record.entry_id.clone(),
        version: record.version,
        metadata: record.meta_data.clone(),
        data: None,
        data_length: record.data_length,
        created: record.created,
        updated: record.updated,
    }
}

fn entry_record(info: &EntryInfo, now: u64) -> EntryRecord {
    let mut record = EntryRecord::new(&info.entry_id);
    record.version = info.version;
    record.meta_data = info.metadata.clone();
    record.data_length = info.data_length;
    record.created = info.created;
    record.updated = if info.updated != 0 { info.updated } else { now };
    if let Some(data) = &info.data {
        record.data = Some(data.clone());
    }
    record
}
