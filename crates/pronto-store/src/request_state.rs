//! In-memory TTL store of per-request state.
//!
//! Serves two readers: the WebSocket layer, which asks who owns a request
//! before admitting a subscriber, and late subscribers, which get the buffered
//! state replayed. Expiry is lazy on read plus a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pronto_core::ids::{RequestId, SessionId, UserId};
use pronto_core::request::{JobStatus, RequestState};

/// Default lifetime of a buffered request.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(300);

/// Owner record of a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOwner {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
}

/// Ownership lookup used for subscribe and publish checks.
pub trait JobOwners: Send + Sync {
    /// `None` when the job is unknown (not started yet, or expired).
    fn owner_of(&self, request_id: &RequestId) -> Option<JobOwner>;
}

struct Entry {
    state: RequestState,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct RequestStateStore {
    entries: DashMap<RequestId, Entry>,
    default_ttl: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl RequestStateStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_STATE_TTL)
    }

    /// Store `state` under its request id with the default TTL. Last write wins.
    pub fn set(&self, state: RequestState) {
        self.set_with_ttl(state, self.default_ttl);
    }

    pub fn set_with_ttl(&self, state: RequestState, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        debug!(
            request_id = %state.request_id,
            ttl_ms = ttl.as_millis() as u64,
            "request state set"
        );
        self.entries
            .insert(state.request_id.clone(), Entry { state, expires_at });
    }

    /// Current state, or `None` if missing or expired.
    pub fn get(&self, request_id: &RequestId) -> Option<RequestState> {
        let now = Instant::now();
        let expired = match self.entries.get(request_id) {
            Some(entry) if entry.is_live(now) => return Some(entry.state.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(request_id, |_, e| !e.is_live(now));
        }
        None
    }

    /// Atomic read-modify-write. Keeps the entry's current expiry and bumps
    /// `updated_at`. Returns the new state, or `None` if the entry is gone.
    pub fn update<F>(&self, request_id: &RequestId, f: F) -> Option<RequestState>
    where
        F: FnOnce(&mut RequestState),
    {
        let now = Instant::now();
        let updated = {
            let mut entry = self.entries.get_mut(request_id)?;
            if entry.is_live(now) {
                f(&mut entry.state);
                entry.state.touch();
                Some(entry.state.clone())
            } else {
                None
            }
        };
        if updated.is_none() {
            self.entries.remove_if(request_id, |_, e| !e.is_live(now));
        }
        updated
    }

    /// Purge every expired entry. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.is_live(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "request state sweep");
        }
        removed
    }

    /// Force every RUNNING job to FAILED. Used on shutdown so nothing is left
    /// looking in-flight.
    pub fn fail_running(&self) -> usize {
        let mut failed = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.state.is_running() {
                entry.state.status = JobStatus::Failed;
                entry.state.touch();
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the periodic sweep. A second call while running is a no-op.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.cleanup();
                    }
                    () = token.cancelled() => break,
                }
            }
        });
        *slot = Some(Sweeper { cancel, handle });
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Stop the sweep and drop all state so the process can exit cleanly.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.cancel.cancel();
        }
        let dropped = self.entries.len();
        self.entries.clear();
        info!(dropped, "request state store shut down");
    }
}

impl Default for RequestStateStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl JobOwners for RequestStateStore {
    fn owner_of(&self, request_id: &RequestId) -> Option<JobOwner> {
        self.get(request_id).map(|state| JobOwner {
            session_id: state.session_id,
            user_id: state.user_id,
        })
    }
}
