//! Incoming-subscriber bookkeeping.
//!
//! One remote peer subscribed to this node's list or to one of its
//! databases is one [`IncomingSubscription`]. The same shape serves both
//! layers; only the payloads differ.

use std::collections::HashMap;

/// Server-side state for one remote subscriber.
#[derive(Debug, Clone)]
pub struct IncomingSubscription {
    /// The subscriber's peer URI.
    pub peer_uri: String,
    /// Cursor token last handed to the subscriber.
    pub cursor: String,
    /// Version token the subscriber was last notified of. Notifies are
    /// coalesced: none is sent while this equals the current version.
    pub notified_version: String,
    /// Epoch seconds after which the subscription lapses.
    pub expires: u64,
}

/// The incoming subscriptions of one list or one database.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionSet {
    subscriptions: HashMap<String, IncomingSubscription>,
}

impl SubscriptionSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes the subscription for a peer.
    ///
    /// A refresh keeps the peer's cursor and notified state; only the
    /// expiry moves.
    pub(crate) fn upsert(&mut self, peer_uri: &str, expires: u64) -> &mut IncomingSubscription {
        self.subscriptions
            .entry(peer_uri.to_string())
            .and_modify(|s| s.expires = expires)
            .or_insert_with(|| IncomingSubscription {
                peer_uri: peer_uri.to_string(),
                cursor: String::new(),
                notified_version: String::new(),
                expires,
            })
    }

    pub(crate) fn remove(&mut self, peer_uri: &str) -> Option<IncomingSubscription> {
        self.subscriptions.remove(peer_uri)
    }

    pub(crate) fn get_mut(&mut self, peer_uri: &str) -> Option<&mut IncomingSubscription> {
        self.subscriptions.get_mut(peer_uri)
    }

    /// Evicts subscriptions whose expiry has passed. Returns how many.
    pub(crate) fn sweep_expired(&mut self, now: u64) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.expires > now);
        before - self.subscriptions.len()
    }

    /// Peers not yet notified of `current_version`.
    pub(crate) fn stale_peers(&self, current_version: &str) -> Vec<String> {
        self.subscriptions
            .values()
            .filter(|s| s.notified_version != current_version)
            .map(|s| s.peer_uri.clone())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_refreshes_expiry_only() {
        let mut set = SubscriptionSet::new();
        {
            let sub = set.upsert("peer://host/bob", 100);
            sub.cursor = "v:change:4".into();
            sub.notified_version = "v".into();
        }

        let sub = set.upsert("peer://host/bob", 200);
        assert_eq!(sub.expires, 200);
        assert_eq!(sub.cursor, "v:change:4");
        assert_eq!(sub.notified_version, "v");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn sweep_evicts_expired() {
        let mut set = SubscriptionSet::new();
        set.upsert("peer://host/bob", 100);
        set.upsert("peer://host/carol", 300);

        assert_eq!(set.sweep_expired(100), 1);
        assert_eq!(set.len(), 1);
        assert!(set.get_mut("peer://host/bob").is_none());
        assert!(set.get_mut("peer://host/carol").is_some());
    }

    #[test]
    fn stale_peers_tracks_notified_version() {
        let mut set = SubscriptionSet::new();
        set.upsert("peer://host/bob", 100).notified_version = "v2".into();
        set.upsert("peer://host/carol", 100).notified_version = "v1".into();

        let stale = set.stale_peers("v2");
        assert_eq!(stale, vec!["peer://host/carol".to_string()]);
    }
}
