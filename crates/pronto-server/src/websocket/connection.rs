//! WebSocket client connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use pronto_core::ids::{ConnectionId, RequestId, SessionId, UserId};
use pronto_core::protocol::{Channel, CloseReason, ServerMessage};

/// Frames queued for the socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<String>),
    Ping,
}

/// One authenticated client socket.
///
/// The session is fixed at admission; subscribe payloads never override it.
pub struct ClientConnection {
    pub id: ConnectionId,
    session_id: SessionId,
    user_id: Option<UserId>,
    tx: mpsc::Sender<Outbound>,
    pub connected_at: Instant,
    /// Set by any pong; cleared by each heartbeat tick.
    is_alive: AtomicBool,
    dropped_messages: AtomicU64,
    subscriptions: Mutex<HashSet<(Channel, RequestId)>>,
    close_reason: Mutex<Option<CloseReason>>,
    closed: CancellationToken,
}

impl ClientConnection {
    pub fn new(
        id: ConnectionId,
        session_id: SessionId,
        user_id: Option<UserId>,
        tx: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            session_id,
            user_id,
            tx,
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            subscriptions: Mutex::new(HashSet::new()),
            close_reason: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Queue a pre-serialized frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.is_closing() {
            return false;
        }
        if self.tx.try_send(Outbound::Text(message)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn send_message(&self, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(
                    conn_id = %self.id,
                    kind = message.kind(),
                    error = %e,
                    "failed to serialize message"
                );
                false
            }
        }
    }

    pub fn ping(&self) -> bool {
        !self.is_closing() && self.tx.try_send(Outbound::Ping).is_ok()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag. `true` if a pong arrived since the
    /// last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Ask the writer to send a close frame with `reason` and stop. The first
    /// reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closed.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Token cancelled by [`close`](Self::close).
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn track(&self, channel: Channel, request_id: RequestId) {
        self.subscriptions.lock().insert((channel, request_id));
    }

    pub(crate) fn untrack(&self, channel: Channel, request_id: &RequestId) {
        self.subscriptions.lock().remove(&(channel, request_id.clone()));
    }

    /// Drain the subscription keys held by this connection.
    pub(crate) fn take_subscriptions(&self) -> Vec<(Channel, RequestId)> {
        self.subscriptions.lock().drain().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
