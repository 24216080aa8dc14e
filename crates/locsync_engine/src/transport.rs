//! Outgoing message channel abstraction.
//!
//! The transport fabric — connection establishment, authentication, wire
//! encoding, correlation of responses — is an external collaborator. The
//! engine borrows a [`MessageSender`] to emit traffic and expects the
//! embedder to deliver responses, timeouts, and incoming requests back
//! through the synchronizer's handler methods.

use locsync_protocol::{RemoteNotify, RemoteRequest, RequestId};
use parking_lot::Mutex;

/// Outgoing channel to the remote peer location.
pub trait MessageSender: Send + Sync {
    /// Emits a request. The embedder must eventually deliver a response or
    /// a timeout for `request_id`.
    fn send_request(&self, request_id: RequestId, request: RemoteRequest);

    /// Pushes a notify to a subscribed peer.
    fn send_notify(&self, peer_uri: &str, notify: RemoteNotify);
}

/// A sender that records traffic, for tests.
#[derive(Default)]
pub struct MockSender {
    requests: Mutex<Vec<(RequestId, RemoteRequest)>>,
    notifies: Mutex<Vec<(String, RemoteNotify)>>,
}

impl MockSender {
    /// Creates an empty mock sender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the recorded requests.
    pub fn take_requests(&self) -> Vec<(RequestId, RemoteRequest)> {
        std::mem::take(&mut self.requests.lock())
    }

    /// Drains the recorded notifies.
    pub fn take_notifies(&self) -> Vec<(String, RemoteNotify)> {
        std::mem::take(&mut self.notifies.lock())
    }

    /// Number of recorded, undrained requests.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of recorded, undrained notifies.
    pub fn notify_count(&self) -> usize {
        self.notifies.lock().len()
    }
}

impl MessageSender for MockSender {
    fn send_request(&self, request_id: RequestId, request: RemoteRequest) {
        self.requests.lock().push((request_id, request));
    }

    fn send_notify(&self, peer_uri: &str, notify: RemoteNotify) {
        self.notifies.lock().push((peer_uri.to_string(), notify));
    }
}
