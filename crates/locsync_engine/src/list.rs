//! The per-location database-list synchronizer.
//!
//! One `LocationSync` exists per remote peer location. It owns the list
//! of databases known at that location, drives the outgoing
//! list-subscribe protocol (remote role) or serves incoming list
//! subscribers (local role), and owns every [`DatabaseSync`] for the
//! location in an arena keyed by database ID. All outstanding requests —
//! its own and its children's — resolve through one pending-request
//! table, and the whole family shares one store and one outgoing sender.

use crate::backoff::BackoffTimer;
use crate::config::SyncConfig;
use crate::database::{AutoDownload, DatabaseState, DatabaseSync, SyncRole};
use crate::pending::{PendingKind, PendingRequests};
use crate::subscriptions::SubscriptionSet;
use crate::transport::MessageSender;
use locsync_protocol::{
    CursorKind, DataGetRequest, DataGetResult, DatabaseInfo, Disposition, ListSubscribeNotify,
    ListSubscribeRequest, ListSubscribeResult, RemoteNotify, RemoteRequest, RemoteResponse,
    RequestId, SubscribeNotify, SubscribeRequest, SubscribeResult, SyncCursor,
};
use locsync_store::{DatabaseRecord, Disposition as StoreDisposition, LocationStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of a list synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Waiting for the first successful list-subscribe exchange.
    Pending,
    /// Synchronizing.
    Ready,
    /// Torn down.
    Shutdown,
}

/// Synchronizer for the database list of one peer location.
pub struct LocationSync {
    peer_uri: String,
    location_id: String,
    location_index: u64,
    role: SyncRole,
    state: ListState,
    config: SyncConfig,
    store: LocationStore,
    sender: Arc<dyn MessageSender>,
    pending: PendingRequests,
    list_subscribe_in_flight: Option<RequestId>,
    list_subscribe_established: bool,
    list_subscribe_expires: u64,
    backoff: BackoffTimer,
    incoming: SubscriptionSet,
    databases: HashMap<String, DatabaseSync>,
}

impl LocationSync {
    /// Opens the synchronizer for a location this node is authoritative
    /// for. Ready as soon as the store is.
    pub fn open_local(
        peer_uri: &str,
        location_id: &str,
        store: LocationStore,
        sender: Arc<dyn MessageSender>,
        config: SyncConfig,
        now: u64,
    ) -> Self {
        Self::open(peer_uri, location_id, SyncRole::Local, store, sender, config, now)
    }

    /// Opens the synchronizer for a location owned by a remote peer.
    /// Pending until the first successful list-subscribe exchange.
    pub fn open_remote(
        peer_uri: &str,
        location_id: &str,
        store: LocationStore,
        sender: Arc<dyn MessageSender>,
        config: SyncConfig,
        now: u64,
    ) -> Self {
        Self::open(peer_uri, location_id, SyncRole::Remote, store, sender, config, now)
    }

    fn open(
        peer_uri: &str,
        location_id: &str,
        role: SyncRole,
        store: LocationStore,
        sender: Arc<dyn MessageSender>,
        config: SyncConfig,
        now: u64,
    ) -> Self {
        let location = store.create_or_obtain(peer_uri, location_id, now);
        let retry = config.retry.clone();
        Self {
            peer_uri: peer_uri.to_string(),
            location_id: location_id.to_string(),
            location_index: location.index,
            role,
            state: match role {
                SyncRole::Local => ListState::Ready,
                SyncRole::Remote => ListState::Pending,
            },
            config,
            store,
            sender,
            pending: PendingRequests::new(),
            list_subscribe_in_flight: None,
            list_subscribe_established: false,
            list_subscribe_expires: 0,
            backoff: BackoffTimer::new(retry),
            incoming: SubscriptionSet::new(),
            databases: HashMap::new(),
        }
    }

    /// The peer URI of the location.
    pub fn peer_uri(&self) -> &str {
        &self.peer_uri
    }

    /// The location identifier.
    pub fn location_id(&self) -> &str {
        &self.location_id
    }

    /// The peer-location row backing this synchronizer.
    pub fn location_index(&self) -> u64 {
        self.location_index
    }

    /// Which side of the protocol this synchronizer plays.
    pub fn role(&self) -> SyncRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListState {
        self.state
    }

    /// Looks up an open database synchronizer.
    pub fn database(&self, database_id: &str) -> Option<&DatabaseSync> {
        self.databases.get(database_id)
    }

    /// Looks up an open database synchronizer for mutation.
    pub fn database_mut(&mut self, database_id: &str) -> Option<&mut DatabaseSync> {
        self.databases.get_mut(database_id)
    }

    /// Number of open database synchronizers.
    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    // ---- step driver ----

    /// Re-evaluates every sub-step in fixed order: the outgoing list
    /// subscribe, the incoming-subscription sweep, the database expiry
    /// sweep, incoming notifies, every child database, and arena pruning
    /// of shut-down children.
    pub fn step(&mut self, now: u64) {
        if self.state == ListState::Shutdown {
            return;
        }
        self.step_remote_subscribe_list(now);
        self.step_local_incoming_timer(now);
        self.step_expired_databases(now);
        self.step_local_incoming_notify(now);
        for database in self.databases.values_mut() {
            database.step(now, &mut self.pending);
        }
        self.databases
            .retain(|_, database| database.state() != DatabaseState::Shutdown);
    }

    fn step_remote_subscribe_list(&mut self, now: u64) {
        if self.role != SyncRole::Remote {
            return;
        }
        if self.list_subscribe_in_flight.is_some() || self.backoff.blocks(now) {
            return;
        }
        let renew_at = self
            .list_subscribe_expires
            .saturating_sub(self.config.resubscribe_margin.as_secs());
        if self.list_subscribe_established && now < renew_at {
            return;
        }
        let version = self
            .store
            .location_by_index(self.location_index)
            .map(|r| r.last_downloaded_version)
            .unwrap_or_default();
        let request = ListSubscribeRequest {
            version,
            expires: now + self.config.subscription_ttl.as_secs(),
        };
        let id = self.pending.issue(PendingKind::ListSubscribe);
        self.list_subscribe_in_flight = Some(id);
        self.sender
            .send_request(id, RemoteRequest::ListSubscribe(request));
    }

    fn step_local_incoming_timer(&mut self, now: u64) {
        let evicted = self.incoming.sweep_expired(now);
        if evicted > 0 {
            debug!(peer_uri = %self.peer_uri, evicted, "expired incoming list subscriptions");
        }
    }

    fn step_local_incoming_notify(&mut self, _now: u64) {
        if self.role != SyncRole::Local {
            return;
        }
        let Some(location) = self.store.location_by_index(self.location_index) else {
            return;
        };
        for peer_uri in self.incoming.stale_peers(&location.update_version) {
            let Some(cursor) = self.incoming.get_mut(&peer_uri).map(|s| s.cursor.clone()) else {
                continue;
            };
            let (databases, version) = self.list_updates_for(&peer_uri, &cursor);
            let complete = self.list_delta_complete(&databases, &version);
            if !databases.is_empty() {
                self.sender.send_notify(
                    &peer_uri,
                    RemoteNotify::List(ListSubscribeNotify {
                        databases,
                        version: version.clone(),
                    }),
                );
            }
            if let Some(subscription) = self.incoming.get_mut(&peer_uri) {
                subscription.cursor = version;
                if complete {
                    subscription.notified_version = location.update_version.clone();
                }
            }
        }
    }

    fn step_expired_databases(&mut self, now: u64) {
        for record in self.store.expired_databases_batch(now, self.config.list_batch) {
            debug!(database_id = %record.database_id, "database expired");
            self.store.remove_database(record.index);
            if let Some(database) = self.databases.get_mut(&record.database_id) {
                database.start_shutdown();
            }
        }
    }

    // ---- update computation ----

    /// Computes the list delta visible to `peer_uri` from a presented
    /// cursor, plus the cursor token to present next time. Permission
    /// filtering applies to both the full list and the change batch.
    fn list_updates_for(&self, peer_uri: &str, existing_version: &str) -> (Vec<DatabaseInfo>, String) {
        let Some(location) = self.store.location_by_index(self.location_index) else {
            return (Vec::new(), String::new());
        };
        let cursor = SyncCursor::resume(existing_version, &location.lineage);
        match cursor.kind {
            CursorKind::FullList => {
                let after = self.store.last_database_change_index();
                let infos = self
                    .store
                    .databases_batch_for_peer(peer_uri, self.location_index, 0, usize::MAX)
                    .into_iter()
                    .map(|r| database_info(Disposition::Add, &r))
                    .collect();
                (infos, SyncCursor::full_after(after).token(&location.lineage))
            }
            CursorKind::ChangeList => {
                let changes = self.store.database_changes_batch_for_peer(
                    peer_uri,
                    self.location_index,
                    cursor.after_index,
                    self.config.list_batch,
                );
                let after = changes.last().map(|c| c.index).unwrap_or(cursor.after_index);
                let mut infos = Vec::with_capacity(changes.len());
                for change in changes {
                    match change.disposition {
                        StoreDisposition::Remove => {
                            infos.push(DatabaseInfo::removed(change.database_id));
                        }
                        disposition => {
                            if let Some(record) = self.store.database_by_index(change.index_database)
                            {
                                infos.push(database_info(proto_disposition(disposition), &record));
                            }
                        }
                    }
                }
                (
                    infos,
                    SyncCursor::changes_after(after).token(&location.lineage),
                )
            }
        }
    }

    fn list_delta_complete(&self, databases: &[DatabaseInfo], version: &str) -> bool {
        match SyncCursor::parse(version) {
            Some((_, cursor)) if cursor.kind == CursorKind::FullList => true,
            _ => databases.len() < self.config.list_batch,
        }
    }

    // ---- incoming service (local role) ----

    /// Serves a list subscribe: creates or refreshes the caller's
    /// subscription and returns the initial delta. `expires == 0`
    /// unsubscribes.
    pub fn handle_list_subscribe_request(
        &mut self,
        from: &str,
        request: &ListSubscribeRequest,
        now: u64,
    ) -> ListSubscribeResult {
        if self.role != SyncRole::Local || self.state == ListState::Shutdown {
            return ListSubscribeResult {
                databases: Vec::new(),
                version: String::new(),
                expires: 0,
            };
        }
        if request.expires == 0 {
            self.incoming.remove(from);
            return ListSubscribeResult {
                databases: Vec::new(),
                version: String::new(),
                expires: 0,
            };
        }
        let granted = request
            .expires
            .min(now + self.config.incoming_ttl_cap.as_secs());
        let (databases, version) = self.list_updates_for(from, &request.version);
        let complete = self.list_delta_complete(&databases, &version);
        let current = self
            .store
            .location_by_index(self.location_index)
            .map(|r| r.update_version)
            .unwrap_or_default();
        let subscription = self.incoming.upsert(from, granted);
        subscription.cursor = version.clone();
        if complete {
            subscription.notified_version = current;
        }
        ListSubscribeResult {
            databases,
            version,
            expires: granted,
        }
    }

    /// Forwards a database subscribe to the addressed synchronizer,
    /// lazily opening local databases. Unknown or unpermitted databases
    /// yield an empty result, never an error.
    pub fn handle_subscribe_request(
        &mut self,
        from: &str,
        request: &SubscribeRequest,
        now: u64,
    ) -> SubscribeResult {
        let empty = SubscribeResult {
            entries: Vec::new(),
            version: String::new(),
            expires: 0,
        };
        if self.role != SyncRole::Local || self.state == ListState::Shutdown {
            return empty;
        }
        let Some(record) = self
            .store
            .database_by_id(self.location_index, &request.database_id)
        else {
            return empty;
        };
        if !self.permitted(record.index, from) {
            return empty;
        }
        match self.ensure_local_database(&request.database_id, record.index) {
            Some(database) => database.handle_subscribe_request(from, request, now),
            None => empty,
        }
    }

    /// Forwards a data-get to the addressed synchronizer. Unknown or
    /// unpermitted databases yield an empty result.
    pub fn handle_data_get_request(&mut self, from: &str, request: &DataGetRequest) -> DataGetResult {
        let empty = DataGetResult {
            entries: Vec::new(),
            errors: Vec::new(),
        };
        if self.role != SyncRole::Local || self.state == ListState::Shutdown {
            return empty;
        }
        let Some(record) = self
            .store
            .database_by_id(self.location_index, &request.database_id)
        else {
            return empty;
        };
        if !self.permitted(record.index, from) {
            return empty;
        }
        match self.ensure_local_database(&request.database_id, record.index) {
            Some(database) => database.handle_data_get_request(request),
            None => empty,
        }
    }

    fn permitted(&self, index_database: u64, peer_uri: &str) -> bool {
        self.store
            .permissions_for_database(index_database)
            .iter()
            .any(|u| u == peer_uri)
    }

    fn ensure_local_database(
        &mut self,
        database_id: &str,
        database_index: u64,
    ) -> Option<&mut DatabaseSync> {
        if !self.databases.contains_key(database_id) {
            let database = DatabaseSync::open_local(
                database_id.to_string(),
                database_index,
                self.store.clone(),
                self.sender.clone(),
                self.config.clone(),
            );
            self.databases.insert(database_id.to_string(), database);
        }
        self.databases.get_mut(database_id)
    }

    // ---- outgoing protocol dispatch ----

    /// Single dispatch point for responses to outstanding requests, both
    /// this synchronizer's and its children's.
    pub fn handle_response(&mut self, request_id: RequestId, response: RemoteResponse, now: u64) {
        match self.pending.complete(request_id) {
            None => {
                debug!(%request_id, "response for unknown request");
            }
            Some(PendingKind::ListSubscribe) => {
                if self.list_subscribe_in_flight == Some(request_id) {
                    self.list_subscribe_in_flight = None;
                }
                match response {
                    RemoteResponse::ListSubscribe(result) => {
                        self.handle_list_subscribe_result(result, now);
                    }
                    _ => debug!(%request_id, "mismatched response type"),
                }
            }
            Some(PendingKind::Subscribe { database_id }) => match response {
                RemoteResponse::Subscribe(result) => {
                    if let Some(database) = self.databases.get_mut(&database_id) {
                        database.handle_subscribe_result(result, now);
                    }
                }
                _ => debug!(%request_id, "mismatched response type"),
            },
            Some(PendingKind::DataGet {
                database_id,
                entry_ids,
            }) => match response {
                RemoteResponse::DataGet(result) => {
                    if let Some(database) = self.databases.get_mut(&database_id) {
                        database.handle_data_get_result(result, entry_ids, now);
                    }
                }
                _ => debug!(%request_id, "mismatched response type"),
            },
        }
    }

    /// Records a timeout or transport failure for an outstanding request
    /// and engages the owning backoff timer.
    pub fn handle_timeout(&mut self, request_id: RequestId, now: u64) {
        match self.pending.complete(request_id) {
            None => {}
            Some(PendingKind::ListSubscribe) => {
                debug!(peer_uri = %self.peer_uri, "list subscribe timed out, backing off");
                self.list_subscribe_in_flight = None;
                self.backoff.notify_failure(now);
            }
            Some(PendingKind::Subscribe { database_id }) => {
                if let Some(database) = self.databases.get_mut(&database_id) {
                    database.handle_subscribe_timeout(now);
                }
            }
            Some(PendingKind::DataGet {
                database_id,
                entry_ids,
            }) => {
                if let Some(database) = self.databases.get_mut(&database_id) {
                    database.handle_data_get_timeout(entry_ids, now);
                }
            }
        }
    }

    fn handle_list_subscribe_result(&mut self, result: ListSubscribeResult, now: u64) {
        self.backoff.notify_success();
        self.list_subscribe_established = true;
        self.list_subscribe_expires = if result.expires != 0 {
            result.expires
        } else {
            now + self.config.subscription_ttl.as_secs()
        };
        self.apply_database_infos(&result.databases, now);
        let _ = self
            .store
            .notify_downloaded(self.location_index, &result.version);
        if self.state == ListState::Pending {
            self.state = ListState::Ready;
        }
    }

    /// Applies a pushed list delta; treated identically to a successful
    /// poll result, restarting the resubscribe cycle.
    pub fn handle_list_notify(&mut self, notify: ListSubscribeNotify, now: u64) {
        if self.role != SyncRole::Remote || self.state == ListState::Shutdown {
            return;
        }
        self.backoff.notify_success();
        self.list_subscribe_established = true;
        self.list_subscribe_expires = now + self.config.subscription_ttl.as_secs();
        self.apply_database_infos(&notify.databases, now);
        let _ = self
            .store
            .notify_downloaded(self.location_index, &notify.version);
        if self.state == ListState::Pending {
            self.state = ListState::Ready;
        }
    }

    /// Routes a pushed entry delta to the addressed open synchronizer.
    pub fn handle_database_notify(&mut self, notify: SubscribeNotify, now: u64) {
        if self.state == ListState::Shutdown {
            return;
        }
        match self.databases.get_mut(&notify.database_id) {
            Some(database) => database.handle_subscribe_notify(notify, now),
            None => debug!(database_id = %notify.database_id, "notify for unopened database"),
        }
    }

    fn apply_database_infos(&mut self, infos: &[DatabaseInfo], now: u64) {
        for info in infos {
            match info.disposition {
                Disposition::Add | Disposition::Update => {
                    if let Some(existing) = self
                        .store
                        .database_by_id(self.location_index, &info.database_id)
                    {
                        let identity_diverged = info.created != 0
                            && existing.created != 0
                            && info.created != existing.created;
                        if let Some(database) = self.databases.get_mut(&info.database_id) {
                            if identity_diverged {
                                database.notify_conflict();
                            } else if info.version != existing.update_version {
                                database.notify_remote_changed();
                            }
                        }
                    }
                    let mut record = DatabaseRecord::new(self.location_index, &info.database_id);
                    record.meta_data = info.metadata.clone();
                    record.created = if info.created != 0 { info.created } else { now };
                    record.expires = info.expires;
                    record.update_version = info.version.clone();
                    if let Err(error) = self.store.add_or_update_database(&mut record) {
                        warn!(database_id = %info.database_id, %error, "could not record database");
                    }
                }
                Disposition::Remove => {
                    if let Some(existing) = self
                        .store
                        .database_by_id(self.location_index, &info.database_id)
                    {
                        self.store.remove_database(existing.index);
                    }
                    if let Some(database) = self.databases.get_mut(&info.database_id) {
                        database.start_shutdown();
                    }
                }
            }
        }
    }

    // ---- local database lifecycle ----

    /// Creates a locally owned database (or updates one that exists),
    /// wholesale-replacing its permission set, and opens its synchronizer.
    pub fn create_local(
        &mut self,
        database_id: &str,
        metadata: Option<String>,
        permitted: &[String],
        expires: u64,
        now: u64,
    ) -> bool {
        if self.role != SyncRole::Local || self.state == ListState::Shutdown {
            return false;
        }
        let mut record = DatabaseRecord::new(self.location_index, database_id);
        record.meta_data = metadata;
        record.created = now;
        record.expires = expires;
        if let Err(error) = self.store.add_or_update_database(&mut record) {
            warn!(database_id, %error, "could not create database");
            return false;
        }
        self.store
            .set_permissions(self.location_index, record.index, permitted);
        self.ensure_local_database(database_id, record.index);
        true
    }

    /// Updates the metadata, permissions, and expiry of an existing
    /// locally owned database. Returns false if it does not exist.
    pub fn update_local(
        &mut self,
        database_id: &str,
        metadata: Option<String>,
        permitted: &[String],
        expires: u64,
        now: u64,
    ) -> bool {
        if self
            .store
            .database_by_id(self.location_index, database_id)
            .is_none()
        {
            return false;
        }
        self.create_local(database_id, metadata, permitted, expires, now)
    }

    /// Removes a locally owned database, shutting its synchronizer down.
    /// Returns false if it does not exist.
    pub fn remove_local(&mut self, database_id: &str, _now: u64) -> bool {
        if self.role != SyncRole::Local || self.state == ListState::Shutdown {
            return false;
        }
        let Some(record) = self.store.database_by_id(self.location_index, database_id) else {
            return false;
        };
        self.store.remove_database(record.index);
        if let Some(database) = self.databases.get_mut(database_id) {
            database.start_shutdown();
        }
        true
    }

    /// Opens the synchronizer for a database owned by the remote peer,
    /// creating a placeholder row if it has not been announced yet. The
    /// placeholder's creation stamp stays 0 (unknown) until the owner
    /// announces it. The body-download policy is fixed for the life of
    /// the synchronizer.
    pub fn open_remote_database(
        &mut self,
        database_id: &str,
        auto_download: AutoDownload,
        _now: u64,
    ) -> bool {
        if self.role != SyncRole::Remote || self.state == ListState::Shutdown {
            return false;
        }
        if self.databases.contains_key(database_id) {
            return true;
        }
        let record = match self.store.database_by_id(self.location_index, database_id) {
            Some(record) => record,
            None => {
                let mut record = DatabaseRecord::new(self.location_index, database_id);
                if let Err(error) = self.store.add_or_update_database(&mut record) {
                    warn!(database_id, %error, "could not record database");
                    return false;
                }
                record
            }
        };
        let database = DatabaseSync::open_remote(
            database_id.to_string(),
            record.index,
            auto_download,
            self.store.clone(),
            self.sender.clone(),
            self.config.clone(),
        );
        self.databases.insert(database_id.to_string(), database);
        true
    }

    /// Raises the conflict flag on an open database synchronizer.
    pub fn notify_conflict(&mut self, database_id: &str) {
        if let Some(database) = self.databases.get_mut(database_id) {
            database.notify_conflict();
        }
    }

    // ---- shutdown ----

    /// Tears the synchronizer down: cancels every child, rejects their
    /// waiters, abandons outstanding requests, and drops incoming
    /// subscriptions. Persisted data is retained — cancellation aborts
    /// the protocol, it does not roll storage back.
    pub fn shutdown(&mut self, now: u64) {
        if self.state == ListState::Shutdown {
            return;
        }
        for database in self.databases.values_mut() {
            database.start_shutdown();
            database.step(now, &mut self.pending);
        }
        self.databases.clear();
        if self.role == SyncRole::Remote && self.list_subscribe_established {
            let id = self.pending.issue_untracked();
            self.sender.send_request(
                id,
                RemoteRequest::ListSubscribe(ListSubscribeRequest {
                    version: String::new(),
                    expires: 0,
                }),
            );
            self.list_subscribe_established = false;
        }
        self.list_subscribe_in_flight = None;
        self.pending.cancel_all();
        self.incoming.clear();
        self.state = ListState::Shutdown;
    }
}

fn proto_disposition(disposition: StoreDisposition) -> Disposition {
    match disposition {
        StoreDisposition::Add => Disposition::Add,
        StoreDisposition::Update => Disposition::Update,
        StoreDisposition::Remove => Disposition::Remove,
    }
}

fn database_info(disposition: Disposition, record: &DatabaseRecord) -> DatabaseInfo {
    DatabaseInfo {
        disposition,
        database_id: record.database_id.clone(),
        version: record.update_version.clone(),
        metadata: record.meta_data.clone(),
        created: record.created,
        expires: record.expires,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockSender;

    const NOW: u64 = 1_000;
    const BOB: &str = "peer://host/bob";
    const CAROL: &str = "peer://host/carol";

    struct Rig {
        sync: LocationSync,
        sender: Arc<MockSender>,
        store: LocationStore,
    }

    fn rig(role: SyncRole) -> Rig {
        let store = LocationStore::new();
        let sender = Arc::new(MockSender::new());
        let config = SyncConfig::new();
        let sync = match role {
            SyncRole::Local => LocationSync::open_local(
                "peer://host/alice",
                "loc-1",
                store.clone(),
                sender.clone(),
                config,
                NOW,
            ),
            SyncRole::Remote => LocationSync::open_remote(
                "peer://host/alice",
                "loc-1",
                store.clone(),
                sender.clone(),
                config,
                NOW,
            ),
        };
        Rig {
            sync,
            sender,
            store,
        }
    }

    fn make_info(disposition: Disposition, database_id: &str, version: &str) -> DatabaseInfo {
        DatabaseInfo {
            disposition,
            database_id: database_id.into(),
            version: version.into(),
            metadata: None,
            created: NOW,
            expires: 0,
        }
    }

    fn list_subscribe(rig: &mut Rig, from: &str) -> ListSubscribeResult {
        rig.sync.handle_list_subscribe_request(
            from,
            &ListSubscribeRequest {
                version: String::new(),
                expires: NOW + 600,
            },
            NOW,
        )
    }

    #[test]
    fn local_list_serves_permission_filtered_delta() {
        let mut rig = rig(SyncRole::Local);
        assert_eq!(rig.sync.state(), ListState::Ready);
        assert!(rig
            .sync
            .create_local("db1", None, &[BOB.to_string()], 0, NOW));

        let result = list_subscribe(&mut rig, BOB);
        assert_eq!(result.databases.len(), 1);
        assert_eq!(result.databases[0].database_id, "db1");
        assert_eq!(result.databases[0].disposition, Disposition::Add);

        // Carol is absent from the permission set and sees nothing.
        let result = list_subscribe(&mut rig, CAROL);
        assert!(result.databases.is_empty());
    }

    #[test]
    fn incoming_list_notify_is_coalesced() {
        let mut rig = rig(SyncRole::Local);
        rig.sync.create_local("db1", None, &[BOB.to_string()], 0, NOW);
        list_subscribe(&mut rig, BOB);

        // Already notified of the current version.
        rig.sync.step(NOW);
        rig.sync.step(NOW + 1);
        assert_eq!(rig.sender.notify_count(), 0);

        rig.sync.create_local("db2", None, &[BOB.to_string()], 0, NOW + 2);
        rig.sync.step(NOW + 2);
        rig.sync.step(NOW + 3);
        let notifies = rig.sender.take_notifies();
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0].0, BOB);
        let RemoteNotify::List(notify) = &notifies[0].1 else {
            panic!("expected list notify");
        };
        assert_eq!(notify.databases.len(), 1);
        assert_eq!(notify.databases[0].database_id, "db2");
    }

    #[test]
    fn removal_is_announced_after_the_row_is_gone() {
        let mut rig = rig(SyncRole::Local);
        rig.sync.create_local("db1", None, &[BOB.to_string()], 0, NOW);
        list_subscribe(&mut rig, BOB);

        assert!(rig.sync.remove_local("db1", NOW + 1));
        rig.sync.step(NOW + 1);
        let notifies = rig.sender.take_notifies();
        assert_eq!(notifies.len(), 1);
        let RemoteNotify::List(notify) = &notifies[0].1 else {
            panic!("expected list notify");
        };
        assert_eq!(notify.databases.len(), 1);
        assert_eq!(notify.databases[0].disposition, Disposition::Remove);
        assert_eq!(notify.databases[0].database_id, "db1");
    }

    #[test]
    fn expired_list_subscriber_is_swept() {
        let mut rig = rig(SyncRole::Local);
        rig.sync.create_local("db1", None, &[BOB.to_string()], 0, NOW);
        rig.sync.handle_list_subscribe_request(
            BOB,
            &ListSubscribeRequest {
                version: String::new(),
                expires: NOW + 10,
            },
            NOW,
        );

        rig.sync.create_local("db2", None, &[BOB.to_string()], 0, NOW + 20);
        rig.sync.step(NOW + 20);
        assert_eq!(rig.sender.notify_count(), 0);
    }

    #[test]
    fn remote_list_subscribe_is_idempotent_and_applies_results() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.step(NOW);
        rig.sync.step(NOW);
        let mut requests = rig.sender.take_requests();
        assert_eq!(requests.len(), 1);
        let (id, request) = requests.remove(0);
        let RemoteRequest::ListSubscribe(request) = request else {
            panic!("expected list subscribe");
        };
        assert!(request.version.is_empty());
        assert_eq!(rig.sync.state(), ListState::Pending);

        rig.sync.handle_response(
            id,
            RemoteResponse::ListSubscribe(ListSubscribeResult {
                databases: vec![make_info(Disposition::Add, "db1", "owner-v1")],
                version: SyncCursor::full_after(3).token("owner-lineage"),
                expires: NOW + 600,
            }),
            NOW,
        );
        assert_eq!(rig.sync.state(), ListState::Ready);

        let location = rig.store.location_by_index(rig.sync.location_index()).unwrap();
        assert_eq!(location.last_downloaded_version, "owner-lineage:full:3");
        let record = rig.store.database_by_id(rig.sync.location_index(), "db1").unwrap();
        assert_eq!(record.update_version, "owner-v1");

        // Established subscription: no resubscribe until renewal is due.
        rig.sync.step(NOW + 1);
        assert_eq!(rig.sender.request_count(), 0);
    }

    #[test]
    fn list_notify_is_treated_as_poll_result() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![make_info(Disposition::Add, "db1", "owner-v1")],
                version: SyncCursor::full_after(1).token("owner-lineage"),
            },
            NOW,
        );
        assert_eq!(rig.sync.state(), ListState::Ready);
        assert!(rig
            .store
            .database_by_id(rig.sync.location_index(), "db1")
            .is_some());
    }

    #[test]
    fn remote_remove_shuts_child_down_and_prunes() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![make_info(Disposition::Add, "db1", "owner-v1")],
                version: SyncCursor::full_after(1).token("owner-lineage"),
            },
            NOW,
        );
        assert!(rig.sync.open_remote_database("db1", AutoDownload::OnDemand, NOW));
        assert_eq!(rig.sync.database_count(), 1);

        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![DatabaseInfo::removed("db1")],
                version: SyncCursor::changes_after(2).token("owner-lineage"),
            },
            NOW + 1,
        );
        rig.sync.step(NOW + 1);
        assert_eq!(rig.sync.database_count(), 0);
        assert!(rig
            .store
            .database_by_id(rig.sync.location_index(), "db1")
            .is_none());
    }

    #[test]
    fn version_movement_wakes_open_child() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![make_info(Disposition::Add, "db1", "owner-v1")],
                version: SyncCursor::full_after(1).token("owner-lineage"),
            },
            NOW,
        );
        rig.sync.open_remote_database("db1", AutoDownload::OnDemand, NOW);

        // Let the child establish its subscription.
        rig.sync.step(NOW);
        let mut requests = rig.sender.take_requests();
        assert_eq!(requests.len(), 1);
        let (id, _) = requests.remove(0);
        rig.sync.handle_response(
            id,
            RemoteResponse::Subscribe(SubscribeResult {
                entries: Vec::new(),
                version: SyncCursor::full_after(0).token("db-lineage"),
                expires: NOW + 600,
            }),
            NOW,
        );
        rig.sync.step(NOW + 1);
        assert_eq!(rig.sender.request_count(), 0);

        // The owner announces a newer database version.
        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![make_info(Disposition::Update, "db1", "owner-v2")],
                version: SyncCursor::changes_after(2).token("owner-lineage"),
            },
            NOW + 2,
        );
        rig.sync.step(NOW + 2);
        let requests = rig.sender.take_requests();
        assert_eq!(requests.len(), 1);
        let RemoteRequest::Subscribe(request) = &requests[0].1 else {
            panic!("expected subscribe");
        };
        // The cursor survives; only the poll is brought forward.
        assert_eq!(request.version, "db-lineage:full:0");
    }

    #[test]
    fn identity_divergence_raises_conflict() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![make_info(Disposition::Add, "db1", "owner-v1")],
                version: SyncCursor::full_after(1).token("owner-lineage"),
            },
            NOW,
        );
        rig.sync.open_remote_database("db1", AutoDownload::OnDemand, NOW);
        rig.sync.step(NOW);
        let mut requests = rig.sender.take_requests();
        let (id, _) = requests.remove(0);
        rig.sync.handle_response(
            id,
            RemoteResponse::Subscribe(SubscribeResult {
                entries: Vec::new(),
                version: SyncCursor::full_after(0).token("db-lineage"),
                expires: NOW + 600,
            }),
            NOW,
        );

        // Same ID, different creation stamp: the database was recreated.
        let mut reborn = make_info(Disposition::Update, "db1", "owner-v9");
        reborn.created = NOW + 50;
        rig.sync.handle_list_notify(
            ListSubscribeNotify {
                databases: vec![reborn],
                version: SyncCursor::changes_after(2).token("owner-lineage"),
            },
            NOW + 50,
        );
        rig.sync.step(NOW + 50);
        let requests = rig.sender.take_requests();
        assert_eq!(requests.len(), 1);
        let RemoteRequest::Subscribe(request) = &requests[0].1 else {
            panic!("expected subscribe");
        };
        // Conflict discarded the cursor: a full resync is requested.
        assert!(request.version.is_empty());
    }

    #[test]
    fn list_timeout_backs_off_and_stays_pending() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.step(NOW);
        let (id, _) = rig.sender.take_requests().remove(0);

        rig.sync.handle_timeout(id, NOW);
        assert_eq!(rig.sync.state(), ListState::Pending);
        rig.sync.step(NOW);
        assert_eq!(rig.sender.request_count(), 0);

        // The retry fires once the delay elapses.
        rig.sync.step(NOW + 2);
        assert_eq!(rig.sender.request_count(), 1);
    }

    #[test]
    fn forwarding_respects_permissions() {
        let mut rig = rig(SyncRole::Local);
        rig.sync.create_local("db1", None, &[BOB.to_string()], 0, NOW);
        rig.sync
            .database_mut("db1")
            .unwrap()
            .add("a", None, Some(vec![1]), NOW);

        let request = SubscribeRequest {
            database_id: "db1".into(),
            version: String::new(),
            expires: NOW + 300,
        };
        let result = rig.sync.handle_subscribe_request(BOB, &request, NOW);
        assert_eq!(result.entries.len(), 1);

        let result = rig.sync.handle_subscribe_request(CAROL, &request, NOW);
        assert!(result.entries.is_empty());
        assert_eq!(result.expires, 0);

        let data_request = DataGetRequest {
            database_id: "db1".into(),
            entry_ids: vec!["a".into()],
        };
        let result = rig.sync.handle_data_get_request(BOB, &data_request);
        assert_eq!(result.entries.len(), 1);
        let result = rig.sync.handle_data_get_request(CAROL, &data_request);
        assert!(result.entries.is_empty());
        assert!(result.errors.is_empty());
    }

    #[test]
    fn expired_databases_are_swept_and_announced() {
        let mut rig = rig(SyncRole::Local);
        rig.sync
            .create_local("db1", None, &[BOB.to_string()], NOW + 100, NOW);
        list_subscribe(&mut rig, BOB);

        rig.sync.step(NOW + 100);
        assert!(rig
            .store
            .database_by_id(rig.sync.location_index(), "db1")
            .is_none());
        assert_eq!(rig.sync.database_count(), 0);

        let notifies = rig.sender.take_notifies();
        assert_eq!(notifies.len(), 1);
        let RemoteNotify::List(notify) = &notifies[0].1 else {
            panic!("expected list notify");
        };
        assert_eq!(notify.databases[0].disposition, Disposition::Remove);
    }

    #[test]
    fn unknown_response_is_ignored() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.handle_response(
            RequestId(99),
            RemoteResponse::ListSubscribe(ListSubscribeResult {
                databases: Vec::new(),
                version: String::new(),
                expires: 0,
            }),
            NOW,
        );
        rig.sync.handle_timeout(RequestId(99), NOW);
        assert_eq!(rig.sync.state(), ListState::Pending);
    }

    #[test]
    fn shutdown_cancels_children_and_unsubscribes() {
        let mut rig = rig(SyncRole::Remote);
        rig.sync.step(NOW);
        let (id, _) = rig.sender.take_requests().remove(0);
        rig.sync.handle_response(
            id,
            RemoteResponse::ListSubscribe(ListSubscribeResult {
                databases: vec![make_info(Disposition::Add, "db1", "owner-v1")],
                version: SyncCursor::full_after(1).token("owner-lineage"),
                expires: NOW + 600,
            }),
            NOW,
        );
        rig.sync.open_remote_database("db1", AutoDownload::OnDemand, NOW);
        rig.sync.step(NOW);
        rig.sender.take_requests();

        rig.sync.shutdown(NOW);
        assert_eq!(rig.sync.state(), ListState::Shutdown);
        assert_eq!(rig.sync.database_count(), 0);
        let requests = rig.sender.take_requests();
        assert!(requests.iter().any(|(_, r)| matches!(
            r,
            RemoteRequest::ListSubscribe(ListSubscribeRequest { expires: 0, .. })
        )));

        // A shut-down synchronizer ignores further traffic.
        rig.sync.step(NOW + 1);
        assert_eq!(rig.sender.request_count(), 0);
        assert!(!rig.sync.create_local("db2", None, &[], 0, NOW + 1));
    }
}
