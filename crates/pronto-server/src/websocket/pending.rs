//! Subscriptions that arrived before their job existed.
//!
//! Entries wait up to the pending TTL for the job to start. Expiry is driven by
//! a single min-heap of deadlines swept on the heartbeat tick and before every
//! activation, so an entry past its deadline can never be activated.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use pronto_core::ids::{ConnectionId, RequestId, SessionId};
use pronto_core::protocol::{Channel, NackReason, ServerMessage};

use super::connection::ClientConnection;

pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(90);

#[derive(Clone)]
pub struct PendingSubscription {
    pub channel: Channel,
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub connection: Arc<ClientConnection>,
    pub registered_at: Instant,
    pub expires_at: Instant,
}

/// Result of one activation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivationSummary {
    pub activated: usize,
    pub rejected: usize,
    /// Entries dropped without a reply (server closing or request gone).
    pub skipped: usize,
}

/// What the activation callback did with an entry whose session matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attach {
    Attached,
    /// The re-check found a different owner.
    Mismatch,
    /// Nothing to attach to any more; the entry is dropped silently.
    Skipped,
}

#[derive(Default)]
struct Inner {
    by_request: HashMap<RequestId, Vec<PendingSubscription>>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, RequestId)>>,
    seq: u64,
}

impl Inner {
    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(Reverse((deadline, _, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((_, _, request_id))) = self.deadlines.pop() else {
                break;
            };
            // The heap may hold stale deadlines for replaced or activated
            // entries; the retain below is authoritative.
            if let Some(entries) = self.by_request.get_mut(&request_id) {
                let before = entries.len();
                entries.retain(|e| e.expires_at > now);
                removed += before - entries.len();
                if entries.is_empty() {
                    self.by_request.remove(&request_id);
                }
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.by_request.values().map(Vec::len).sum()
    }
}

pub struct PendingSubscriptionManager {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl PendingSubscriptionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Buffer a subscription and ack it as pending. A repeat for the same
    /// connection, channel and request replaces the earlier entry.
    pub fn register(
        &self,
        channel: Channel,
        request_id: RequestId,
        connection: &Arc<ClientConnection>,
    ) {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let seq = inner.seq;
            let entries = inner.by_request.entry(request_id.clone()).or_default();
            entries.retain(|e| !(e.connection.id == connection.id && e.channel == channel));
            entries.push(PendingSubscription {
                channel,
                request_id: request_id.clone(),
                session_id: connection.session_id().clone(),
                connection: Arc::clone(connection),
                registered_at: now,
                expires_at,
            });
            inner.deadlines.push(Reverse((expires_at, seq, request_id.clone())));
        }
        debug!(
            conn_id = %connection.id,
            %channel,
            request_id = %request_id,
            "subscription pending"
        );
        connection.send_message(&ServerMessage::sub_ack(channel, request_id, true));
    }

    /// Resolve every pending entry for `request_id` now that its owner is
    /// known. Matching sessions are handed to `subscribe`, which re-checks
    /// ownership itself and reports what it did; mismatches get a
    /// `session_mismatch` nack. All entries are consumed.
    pub fn activate<F>(
        &self,
        request_id: &RequestId,
        owner: &SessionId,
        mut subscribe: F,
    ) -> ActivationSummary
    where
        F: FnMut(&PendingSubscription) -> Attach,
    {
        let entries = {
            let mut inner = self.inner.lock();
            inner.sweep(Instant::now());
            inner.by_request.remove(request_id).unwrap_or_default()
        };

        let mut summary = ActivationSummary::default();
        for entry in &entries {
            if entry.connection.is_closing() {
                continue;
            }
            let outcome = if &entry.session_id == owner {
                subscribe(entry)
            } else {
                Attach::Mismatch
            };
            match outcome {
                Attach::Attached => summary.activated += 1,
                Attach::Mismatch => {
                    entry.connection.send_message(&ServerMessage::sub_nack(
                        entry.channel,
                        entry.request_id.clone(),
                        NackReason::SessionMismatch,
                    ));
                    summary.rejected += 1;
                }
                Attach::Skipped => summary.skipped += 1,
            }
        }
        if !entries.is_empty() {
            debug!(
                request_id = %request_id,
                activated = summary.activated,
                rejected = summary.rejected,
                skipped = summary.skipped,
                "pending subscriptions resolved"
            );
        }
        summary
    }

    /// Drop expired entries without notifying anyone.
    pub fn cleanup_expired(&self) -> usize {
        self.inner.lock().sweep(Instant::now())
    }

    /// Remove one entry (client unsubscribed before the job started).
    pub fn remove(
        &self,
        channel: Channel,
        request_id: &RequestId,
        connection_id: &ConnectionId,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.by_request.get_mut(request_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| !(e.channel == channel && &e.connection.id == connection_id));
        let removed = entries.len() != before;
        if entries.is_empty() {
            inner.by_request.remove(request_id);
        }
        removed
    }

    /// Remove every entry held by a closing connection.
    pub fn remove_connection(&self, connection_id: &ConnectionId) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        inner.by_request.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| &e.connection.id != connection_id);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_request.clear();
        inner.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().by_request.is_empty()
    }
}

impl Default for PendingSubscriptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_TTL)
    }
}
