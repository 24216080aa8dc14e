//! Pending-request and pending-entry bookkeeping.
//!
//! All outstanding remote requests live in one table keyed by request ID,
//! and every response or timeout resolves through that single table —
//! there are no per-request callbacks to re-enter.

use crate::error::{SyncError, SyncResult};
use locsync_protocol::RequestId;
use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

/// What an outstanding request was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingKind {
    /// List-level subscribe for the location.
    ListSubscribe,
    /// Entry-level subscribe for one database.
    Subscribe {
        /// Target database.
        database_id: String,
    },
    /// Entry body fetch for one database.
    DataGet {
        /// Target database.
        database_id: String,
        /// Bodies requested.
        entry_ids: Vec<String>,
    },
}

/// Table of outstanding requests for one peer location.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    next_id: u64,
    in_flight: HashMap<RequestId, PendingKind>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates an ID and records the request as outstanding.
    pub(crate) fn issue(&mut self, kind: PendingKind) -> RequestId {
        let id = self.issue_untracked();
        self.in_flight.insert(id, kind);
        id
    }

    /// Allocates an ID without tracking, for fire-and-forget requests
    /// (unsubscribes during shutdown).
    pub(crate) fn issue_untracked(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId(self.next_id)
    }

    /// Settles an outstanding request, returning what it was for.
    pub(crate) fn complete(&mut self, id: RequestId) -> Option<PendingKind> {
        self.in_flight.remove(&id)
    }

    /// Abandons every outstanding request.
    pub(crate) fn cancel_all(&mut self) {
        self.in_flight.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.in_flight.len()
    }
}

/// Settles once all entry bodies a caller asked for have arrived.
///
/// Returned by `DatabaseSync::notify_when_data_ready`; backed by a
/// channel so the caller may poll or block.
#[derive(Debug)]
pub struct DataReadyHandle {
    rx: Receiver<SyncResult<()>>,
}

impl DataReadyHandle {
    /// Polls for the outcome without blocking.
    pub fn try_ready(&self) -> Option<SyncResult<()>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SyncError::Cancelled)),
        }
    }

    /// Blocks until the outcome settles.
    pub fn wait(&self) -> SyncResult<()> {
        self.rx.recv().unwrap_or(Err(SyncError::Cancelled))
    }
}

#[derive(Debug)]
struct EntryWaiter {
    remaining: BTreeSet<String>,
    tx: Sender<SyncResult<()>>,
}

/// Fan-in map of callers waiting for entry bodies.
#[derive(Debug, Default)]
pub(crate) struct PendingEntryMap {
    waiters: Vec<EntryWaiter>,
}

impl PendingEntryMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers interest in a set of still-unfetched entries.
    ///
    /// An empty set settles immediately.
    pub(crate) fn register(&mut self, remaining: BTreeSet<String>) -> DataReadyHandle {
        let (tx, rx) = channel();
        if remaining.is_empty() {
            let _ = tx.send(Ok(()));
        } else {
            self.waiters.push(EntryWaiter { remaining, tx });
        }
        DataReadyHandle { rx }
    }

    /// Union of all entry IDs any waiter is still missing.
    pub(crate) fn wanted(&self) -> BTreeSet<String> {
        self.waiters
            .iter()
            .flat_map(|w| w.remaining.iter().cloned())
            .collect()
    }

    /// Marks one entry's body as arrived, settling waiters that are now
    /// complete.
    pub(crate) fn satisfy(&mut self, entry_id: &str) {
        for waiter in &mut self.waiters {
            waiter.remaining.remove(entry_id);
        }
        self.waiters.retain(|w| {
            if w.remaining.is_empty() {
                let _ = w.tx.send(Ok(()));
                false
            } else {
                true
            }
        });
    }

    /// Rejects every waiter still missing any of `entry_ids`.
    pub(crate) fn reject_waiting_on(&mut self, entry_ids: &[String], error: SyncError) {
        self.waiters.retain(|w| {
            if entry_ids.iter().any(|id| w.remaining.contains(id)) {
                let _ = w.tx.send(Err(error.clone()));
                false
            } else {
                true
            }
        });
    }

    /// Rejects every waiter.
    pub(crate) fn reject_all(&mut self, error: SyncError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(error.clone()));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
