//! Channel registry: who is subscribed to which `(channel, request)` pair,
//! and the only path by which job events reach a socket.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pronto_core::ids::{ConnectionId, RequestId, SessionId};
use pronto_core::protocol::{Channel, ClientMessage, CloseReason, NackReason, ServerMessage};
use pronto_core::request::RequestState;
use pronto_store::{JobOwners, RequestStateStore};

use super::connection::ClientConnection;
use super::pending::{ActivationSummary, Attach, PendingSubscriptionManager};
use crate::config::ServerConfig;
use crate::rate_limit::{RateLimitConfig, RateLimiter};

type SubscriptionKey = (Channel, RequestId);

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub heartbeat_interval: Duration,
    pub pending_ttl: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ManagerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            pending_ttl: config.pending_ttl,
            rate_limit: config.rate_limit.clone(),
        }
    }
}

/// What a subscribe attempt turned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Active,
    Pending,
    Rejected(NackReason),
}

/// Counters from one heartbeat tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub timed_out: usize,
    pub pending_expired: usize,
    /// Subscriptions dropped because their request state is gone.
    pub orphaned: usize,
}

struct Heartbeat {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

type Subscribers = HashMap<ConnectionId, Arc<ClientConnection>>;

pub struct WebSocketManager {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    subscriptions: RwLock<HashMap<SubscriptionKey, Subscribers>>,
    states: Arc<RequestStateStore>,
    pending: PendingSubscriptionManager,
    rate_limiter: RateLimiter,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<Heartbeat>>,
    /// Session tasks, so shutdown can wait for their close frames.
    sessions: Mutex<JoinSet<()>>,
    shut_down: AtomicBool,
}

impl WebSocketManager {
    pub fn new(config: ManagerConfig, states: Arc<RequestStateStore>) -> Self {
        Self {
            connections: DashMap::new(),
            subscriptions: RwLock::new(HashMap::new()),
            states,
            pending: PendingSubscriptionManager::new(config.pending_ttl),
            rate_limiter: RateLimiter::new(config.rate_limit),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat: Mutex::new(None),
            sessions: Mutex::new(JoinSet::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn states(&self) -> &Arc<RequestStateStore> {
        &self.states
    }

    /// Admit an authenticated connection. After shutdown the connection is
    /// closed immediately and `false` is returned.
    pub fn register_connection(&self, connection: Arc<ClientConnection>) -> bool {
        if self.is_shut_down() {
            connection.close(CloseReason::ServerShutdown);
            return false;
        }
        info!(
            conn_id = %connection.id,
            session_id = %connection.session_id(),
            "client connected"
        );
        let _ = self.connections.insert(connection.id.clone(), connection);
        true
    }

    /// Run a socket session on a tracked task. Finished sessions are reaped
    /// on each call.
    pub fn spawn_session<F>(&self, session: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut sessions = self.sessions.lock();
        while sessions.try_join_next().is_some() {}
        let _ = sessions.spawn(session);
    }

    /// Wait for every session task spawned so far. Call after
    /// [`shutdown`](Self::shutdown) has closed their sockets.
    pub async fn drain_sessions(&self) -> usize {
        let mut sessions = std::mem::take(&mut *self.sessions.lock());
        let mut drained = 0;
        while let Some(result) = sessions.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "session task failed");
            }
            drained += 1;
        }
        debug!(drained, "session tasks drained");
        drained
    }

    /// Remove a connection and every piece of state keyed by it.
    pub fn unregister_connection(&self, connection_id: &ConnectionId) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };
        let keys = connection.take_subscriptions();
        let released = keys.len();
        {
            let mut subs = self.subscriptions.write();
            for key in keys {
                if let Some(subscribers) = subs.get_mut(&key) {
                    let _ = subscribers.remove(connection_id);
                    if subscribers.is_empty() {
                        let _ = subs.remove(&key);
                    }
                }
            }
        }
        let pending = self.pending.remove_connection(connection_id);
        self.rate_limiter.remove(connection_id);
        info!(
            conn_id = %connection_id,
            released,
            pending,
            dropped = connection.drop_count(),
            "client disconnected"
        );
    }

    /// Dispatch one inbound text frame. Unparsable frames get an
    /// `INVALID_MESSAGE` error and the connection stays open.
    pub fn handle_client_message(&self, connection: &Arc<ClientConnection>, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id = %connection.id, error = %e, "invalid client message");
                connection.send_message(&ServerMessage::invalid_message(e.to_string()));
                return;
            }
        };
        match message {
            ClientMessage::Subscribe { channel, request_id } => {
                if request_id.as_str().trim().is_empty() {
                    let msg = ServerMessage::invalid_message("requestId must not be empty");
                    connection.send_message(&msg);
                    return;
                }
                let _ = self.subscribe(channel, request_id, connection);
            }
            ClientMessage::Unsubscribe { channel, request_id } => {
                self.unsubscribe(channel, &request_id, connection);
            }
        }
    }

    /// Subscribe `connection` to `(channel, request_id)` under its own
    /// authenticated session.
    pub fn subscribe(
        &self,
        channel: Channel,
        request_id: RequestId,
        connection: &Arc<ClientConnection>,
    ) -> SubscribeOutcome {
        if !self.rate_limiter.check(&connection.id) {
            warn!(
                conn_id = %connection.id,
                %channel,
                request_id = %request_id,
                "subscribe rate limited"
            );
            connection.send_message(&ServerMessage::sub_nack(
                channel,
                request_id,
                NackReason::RateLimited,
            ));
            return SubscribeOutcome::Rejected(NackReason::RateLimited);
        }

        if let Some(state) = self.states.get(&request_id) {
            return self.subscribe_verified(channel, &state, connection);
        }

        self.pending.register(channel, request_id.clone(), connection);
        // The job may have started between the lookup and the registration.
        if self.states.get(&request_id).is_some() {
            let _ = self.activate_pending(&request_id);
        }
        SubscribeOutcome::Pending
    }

    fn subscribe_verified(
        &self,
        channel: Channel,
        state: &RequestState,
        connection: &Arc<ClientConnection>,
    ) -> SubscribeOutcome {
        if !state.is_owned_by(connection.session_id()) {
            warn!(
                conn_id = %connection.id,
                %channel,
                request_id = %state.request_id,
                "subscribe rejected: session mismatch"
            );
            connection.send_message(&ServerMessage::sub_nack(
                channel,
                state.request_id.clone(),
                NackReason::SessionMismatch,
            ));
            return SubscribeOutcome::Rejected(NackReason::SessionMismatch);
        }
        self.attach(channel, state, connection);
        SubscribeOutcome::Active
    }

    /// Register, ack and replay. Ownership must already be verified.
    fn attach(&self, channel: Channel, state: &RequestState, connection: &Arc<ClientConnection>) {
        let request_id = state.request_id.clone();
        {
            let mut subs = self.subscriptions.write();
            let _ = subs
                .entry((channel, request_id.clone()))
                .or_default()
                .insert(connection.id.clone(), Arc::clone(connection));
        }
        connection.track(channel, request_id.clone());
        debug!(conn_id = %connection.id, %channel, request_id = %request_id, "subscribed");
        connection.send_message(&ServerMessage::sub_ack(channel, request_id, false));
        connection.send_message(&ServerMessage::request_state(channel, state, true));
    }

    /// Drop a subscription and any pending entry for it. No reply is sent.
    pub fn unsubscribe(
        &self,
        channel: Channel,
        request_id: &RequestId,
        connection: &Arc<ClientConnection>,
    ) {
        let key = (channel, request_id.clone());
        let removed = {
            let mut subs = self.subscriptions.write();
            match subs.get_mut(&key) {
                Some(subscribers) => {
                    let removed = subscribers.remove(&connection.id).is_some();
                    if subscribers.is_empty() {
                        let _ = subs.remove(&key);
                    }
                    removed
                }
                None => false,
            }
        };
        connection.untrack(channel, request_id);
        let pending = self.pending.remove(channel, request_id, &connection.id);
        debug!(
            conn_id = %connection.id,
            %channel,
            request_id = %request_id,
            removed,
            pending,
            "unsubscribed"
        );
    }

    /// Deliver `message` to subscribers of `(channel, request_id)` whose
    /// session is `owner`. Returns the number of sockets it was queued on.
    pub fn publish_to_channel(
        &self,
        channel: Channel,
        request_id: &RequestId,
        owner: &SessionId,
        message: &ServerMessage,
    ) -> usize {
        let recipients: Vec<Arc<ClientConnection>> = {
            let subs = self.subscriptions.read();
            match subs.get(&(channel, request_id.clone())) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return 0,
            }
        };
        let json = match serde_json::to_string(message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to serialize message");
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in recipients {
            if conn.session_id() != owner {
                warn!(
                    conn_id = %conn.id,
                    %channel,
                    request_id = %request_id,
                    "skipping subscriber from another session"
                );
                continue;
            }
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, dropped = conn.drop_count(), "failed to queue message");
            }
        }
        debug!(kind = message.kind(), %channel, request_id = %request_id, delivered, "published");
        delivered
    }

    /// Resolve pending subscriptions for a job that now has an owner.
    pub fn activate_pending(&self, request_id: &RequestId) -> ActivationSummary {
        let Some(owner) = self.states.owner_of(request_id) else {
            return ActivationSummary::default();
        };
        self.pending.activate(request_id, &owner.session_id, |entry| {
            if self.is_shut_down() {
                return Attach::Skipped;
            }
            // Re-read rather than trust the owner captured above.
            match self.states.get(request_id) {
                Some(state) if state.is_owned_by(&entry.session_id) => {
                    self.attach(entry.channel, &state, &entry.connection);
                    Attach::Attached
                }
                Some(_) => Attach::Mismatch,
                None => Attach::Skipped,
            }
        })
    }

    /// Drop every subscription for a finished request. Returns how many
    /// socket registrations were released.
    pub fn complete_request(&self, request_id: &RequestId) -> usize {
        let mut released = 0;
        for channel in Channel::ALL {
            let subscribers = self.subscriptions.write().remove(&(channel, request_id.clone()));
            for conn in subscribers.into_iter().flat_map(HashMap::into_values) {
                conn.untrack(channel, request_id);
                released += 1;
            }
        }
        if released > 0 {
            debug!(request_id = %request_id, released, "request subscriptions released");
        }
        released
    }

    /// Start the heartbeat loop. A second call while running is a no-op.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() || self.is_shut_down() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);
        let interval = self.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume first immediate tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = manager.heartbeat_tick();
                        if report.timed_out > 0
                            || report.pending_expired > 0
                            || report.orphaned > 0
                        {
                            debug!(?report, "heartbeat");
                        }
                    }
                    () = token.cancelled() => break,
                }
            }
        });
        *slot = Some(Heartbeat { cancel, handle });
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|h| !h.handle.is_finished())
    }

    /// One heartbeat pass: ping live sockets, close silent ones, sweep expired
    /// pending entries and subscriptions whose request state has expired.
    pub fn heartbeat_tick(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let connections: Vec<Arc<ClientConnection>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        for conn in connections {
            if conn.check_alive() {
                if conn.ping() {
                    report.pinged += 1;
                }
            } else {
                warn!(conn_id = %conn.id, "no pong since last heartbeat, closing");
                conn.close(CloseReason::HeartbeatTimeout);
                self.unregister_connection(&conn.id);
                report.timed_out += 1;
            }
        }
        report.pending_expired = self.pending.cleanup_expired();
        report.orphaned = self.prune_orphaned();
        report
    }

    fn prune_orphaned(&self) -> usize {
        let orphaned: Vec<SubscriptionKey> = self
            .subscriptions
            .read()
            .keys()
            .filter(|(_, request_id)| self.states.get(request_id).is_none())
            .cloned()
            .collect();
        let mut released = 0;
        for (channel, request_id) in orphaned {
            let subscribers = self.subscriptions.write().remove(&(channel, request_id.clone()));
            for conn in subscribers.into_iter().flat_map(HashMap::into_values) {
                conn.untrack(channel, &request_id);
                released += 1;
            }
        }
        released
    }

    /// Close every socket with `SERVER_SHUTDOWN`, stop the heartbeat and
    /// clear all registries. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.cancel.cancel();
            heartbeat.handle.abort();
        }
        let closed = self.connections.len();
        for entry in self.connections.iter() {
            entry.value().close(CloseReason::ServerShutdown);
        }
        self.connections.clear();
        self.subscriptions.write().clear();
        self.pending.clear();
        self.rate_limiter.clear();
        info!(closed, "websocket manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn subscriber_count(&self, channel: Channel, request_id: &RequestId) -> usize {
        self.subscriptions
            .read()
            .get(&(channel, request_id.clone()))
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::Outbound;
    use pronto_core::ids::UserId;
    use pronto_core::job::JobResult;
    use tokio::sync::mpsc;

    struct Client {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        fn next(&mut self) -> Option<serde_json::Value> {
            loop {
                match self.rx.try_recv().ok()? {
                    Outbound::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                    Outbound::Ping => continue,
                }
            }
        }

        fn drain(&mut self) -> Vec<serde_json::Value> {
            std::iter::from_fn(|| self.next()).collect()
        }
    }

    fn manager() -> Arc<WebSocketManager> {
        Arc::new(WebSocketManager::new(
            ManagerConfig::default(),
            Arc::new(RequestStateStore::with_defaults()),
        ))
    }

    fn client(manager: &WebSocketManager, session: &str) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::new(),
            SessionId::from_raw(session),
            None,
            tx,
        ));
        assert!(manager.register_connection(Arc::clone(&conn)));
        Client { conn, rx }
    }

    fn start_job(manager: &WebSocketManager, request: &str, session: &str) -> ActivationSummary {
        manager.states().set(RequestState::running(
            RequestId::from_raw(request),
            SessionId::from_raw(session),
            Some(UserId::from_raw("u1")),
        ));
        manager.activate_pending(&RequestId::from_raw(request))
    }

    fn req(id: &str) -> RequestId {
        RequestId::from_raw(id)
    }

    fn patch() -> ServerMessage {
        let result = JobResult::found("wolt", "p1", "https://wolt.com/p1", None);
        ServerMessage::result_patch(req("r1"), &result)
    }

    fn publish(m: &WebSocketManager, channel: Channel, request: &str, session: &str) -> usize {
        m.publish_to_channel(channel, &req(request), &SessionId::from_raw(session), &patch())
    }

    #[tokio::test]
    async fn subscribe_to_own_job_acks_and_replays() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let mut a = client(&m, "s1");

        assert_eq!(m.subscribe(Channel::Search, req("r1"), &a.conn), SubscribeOutcome::Active);
        let frames = a.drain();
        assert_eq!(frames[0]["type"], "sub_ack");
        assert_eq!(frames[0]["pending"], false);
        assert_eq!(frames[1]["type"], "request_state");
        assert_eq!(frames[1]["replay"], true);
        assert_eq!(frames[1]["status"], "RUNNING");
        assert_eq!(m.subscriber_count(Channel::Search, &req("r1")), 1);
    }

    #[tokio::test]
    async fn foreign_session_is_nacked_and_not_registered() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let mut b = client(&m, "s2");

        assert_eq!(
            m.subscribe(Channel::Search, req("r1"), &b.conn),
            SubscribeOutcome::Rejected(NackReason::SessionMismatch)
        );
        let frames = b.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["reason"], "session_mismatch");
        assert_eq!(m.subscriber_count(Channel::Search, &req("r1")), 0);
        assert_eq!(publish(&m, Channel::Search, "r1", "s1"), 0);
        assert!(b.next().is_none());
    }

    #[tokio::test]
    async fn pending_then_activated_receives_publish() {
        let m = manager();
        let mut a = client(&m, "s1");
        let mut b = client(&m, "s2");

        assert_eq!(m.subscribe(Channel::Search, req("r1"), &a.conn), SubscribeOutcome::Pending);
        assert_eq!(m.subscribe(Channel::Search, req("r1"), &b.conn), SubscribeOutcome::Pending);
        assert_eq!(a.next().unwrap()["pending"], true);
        assert_eq!(b.next().unwrap()["pending"], true);
        assert_eq!(m.pending_count(), 2);

        let summary = start_job(&m, "r1", "s1");
        assert_eq!(
            summary,
            ActivationSummary {
                activated: 1,
                rejected: 1,
                skipped: 0
            }
        );

        let ack = a.next().unwrap();
        assert_eq!(ack["type"], "sub_ack");
        assert_eq!(ack["pending"], false);
        assert_eq!(a.next().unwrap()["type"], "request_state");
        assert_eq!(b.next().unwrap()["reason"], "session_mismatch");

        let delivered = publish(&m, Channel::Search, "r1", "s1");
        assert_eq!(delivered, 1);
        assert_eq!(a.next().unwrap()["type"], "RESULT_PATCH");
        assert!(b.next().is_none());
    }

    #[tokio::test]
    async fn publish_requires_exact_channel_and_owner() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let mut a = client(&m, "s1");
        let _ = m.subscribe(Channel::Assistant, req("r1"), &a.conn);
        let _ = a.drain();

        assert_eq!(publish(&m, Channel::Search, "r1", "s1"), 0);
        assert_eq!(publish(&m, Channel::Assistant, "r2", "s1"), 0);
        assert_eq!(publish(&m, Channel::Assistant, "r1", "s9"), 0);
        assert_eq!(publish(&m, Channel::Assistant, "r1", "s1"), 1);
    }

    #[tokio::test]
    async fn duplicate_subscribe_delivers_once() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let mut a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = a.drain();

        assert_eq!(publish(&m, Channel::Search, "r1", "s1"), 1);
        assert_eq!(a.drain().len(), 1);
    }

    #[tokio::test]
    async fn publishes_arrive_in_order() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let mut a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = a.drain();

        for provider in ["wolt", "tenbis", "mishloha"] {
            let msg = ServerMessage::result_patch(req("r1"), &JobResult::not_found(provider, "p1"));
            let owner = SessionId::from_raw("s1");
            let _ = m.publish_to_channel(Channel::Search, &req("r1"), &owner, &msg);
        }
        let providers: Vec<String> = a
            .drain()
            .iter()
            .map(|f| f["patch"]["providers"].as_object().unwrap().keys().next().unwrap().clone())
            .collect();
        assert_eq!(providers, vec!["wolt", "tenbis", "mishloha"]);
    }

    #[tokio::test]
    async fn eleventh_subscribe_is_rate_limited() {
        let m = manager();
        let mut a = client(&m, "s1");
        for i in 0..10 {
            let outcome = m.subscribe(Channel::Search, req(&format!("r{i}")), &a.conn);
            assert_eq!(outcome, SubscribeOutcome::Pending);
        }
        assert_eq!(
            m.subscribe(Channel::Search, req("r10"), &a.conn),
            SubscribeOutcome::Rejected(NackReason::RateLimited)
        );
        let last = a.drain().pop().unwrap();
        assert_eq!(last["type"], "sub_nack");
        assert_eq!(last["reason"], "rate_limited");
        assert!(!a.conn.is_closing());
    }

    #[tokio::test]
    async fn unsubscribe_removes_active_and_pending() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = m.subscribe(Channel::Search, req("r2"), &a.conn);
        assert_eq!(m.pending_count(), 1);

        m.unsubscribe(Channel::Search, &req("r1"), &a.conn);
        m.unsubscribe(Channel::Search, &req("r2"), &a.conn);
        assert_eq!(m.subscriber_count(Channel::Search, &req("r1")), 0);
        assert_eq!(m.pending_count(), 0);
        assert_eq!(a.conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn invalid_frames_get_error_and_stay_open() {
        let m = manager();
        let mut a = client(&m, "s1");
        m.handle_client_message(&a.conn, "not json");
        let unknown_channel = r#"{"type":"subscribe","channel":"billing","requestId":"r1"}"#;
        let blank_request = r#"{"type":"subscribe","channel":"search","requestId":" "}"#;
        m.handle_client_message(&a.conn, unknown_channel);
        m.handle_client_message(&a.conn, blank_request);
        let frames = a.drain();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f["code"] == "INVALID_MESSAGE"));
        assert!(!a.conn.is_closing());
    }

    #[tokio::test]
    async fn client_message_subscribe_uses_connection_session() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let mut b = client(&m, "s2");
        m.handle_client_message(
            &b.conn,
            r#"{"type":"subscribe","channel":"search","requestId":"r1","sessionId":"s1"}"#,
        );
        assert_eq!(b.next().unwrap()["reason"], "session_mismatch");
    }

    #[tokio::test]
    async fn complete_request_releases_all_channels() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = m.subscribe(Channel::Assistant, req("r1"), &a.conn);

        assert_eq!(m.complete_request(&req("r1")), 2);
        assert_eq!(a.conn.subscription_count(), 0);
        assert_eq!(m.complete_request(&req("r1")), 0);
    }

    #[tokio::test]
    async fn unregister_clears_connection_state() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = m.subscribe(Channel::Search, req("r2"), &a.conn);

        m.unregister_connection(&a.conn.id);
        assert_eq!(m.connection_count(), 0);
        assert_eq!(m.pending_count(), 0);
        assert_eq!(m.subscriber_count(Channel::Search, &req("r1")), 0);
    }

    #[tokio::test]
    async fn heartbeat_closes_silent_connections() {
        let m = manager();
        let mut a = client(&m, "s1");
        let b = client(&m, "s1");

        let first = m.heartbeat_tick();
        assert_eq!(first.pinged, 2);
        assert!(matches!(a.rx.try_recv(), Ok(Outbound::Ping)));

        a.conn.mark_alive();
        let second = m.heartbeat_tick();
        assert_eq!(second.pinged, 1);
        assert_eq!(second.timed_out, 1);
        assert_eq!(b.conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert_eq!(m.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sweeps_expired_pending() {
        let m = manager();
        let a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        tokio::time::advance(Duration::from_secs(91)).await;
        a.conn.mark_alive();
        assert_eq!(m.heartbeat_tick().pending_expired, 1);
        assert_eq!(m.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_activation_delivers_nothing() {
        let m = manager();
        let mut a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = a.drain();
        tokio::time::advance(Duration::from_secs(91)).await;

        assert_eq!(start_job(&m, "r1", "s1"), ActivationSummary::default());
        assert_eq!(publish(&m, Channel::Search, "r1", "s1"), 0);
        assert!(a.next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_drops_subscriptions_of_expired_requests() {
        let m = manager();
        m.states().set_with_ttl(
            RequestState::running(req("r1"), SessionId::from_raw("s1"), None),
            Duration::from_secs(5),
        );
        let a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        tokio::time::advance(Duration::from_secs(6)).await;
        a.conn.mark_alive();
        assert_eq!(m.heartbeat_tick().orphaned, 1);
        assert_eq!(a.conn.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_runs_until_shutdown() {
        let m = manager();
        let b = client(&m, "s1");
        m.start_heartbeat();
        m.start_heartbeat();
        assert!(m.heartbeat_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(b.conn.close_reason(), Some(CloseReason::HeartbeatTimeout));

        m.shutdown();
        tokio::task::yield_now().await;
        assert!(!m.heartbeat_running());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let m = manager();
        let _ = start_job(&m, "r1", "s1");
        let a = client(&m, "s1");
        let _ = m.subscribe(Channel::Search, req("r1"), &a.conn);
        let _ = m.subscribe(Channel::Search, req("r2"), &a.conn);

        m.shutdown();
        m.shutdown();
        assert!(m.is_shut_down());
        assert_eq!(a.conn.close_reason(), Some(CloseReason::ServerShutdown));
        assert_eq!(m.connection_count(), 0);
        assert_eq!(m.pending_count(), 0);
        assert_eq!(m.subscriber_count(Channel::Search, &req("r1")), 0);

        let (tx, _rx) = mpsc::channel(1);
        let late = Arc::new(ClientConnection::new(ConnectionId::new(), SessionId::new(), None, tx));
        assert!(!m.register_connection(Arc::clone(&late)));
        assert!(late.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_session_tasks() {
        let m = manager();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), SessionId::new(), None, tx));
        assert!(m.register_connection(Arc::clone(&conn)));
        let flushed = Arc::new(AtomicBool::new(false));
        {
            let flushed = Arc::clone(&flushed);
            let closed = conn.closed();
            m.spawn_session(async move {
                closed.cancelled().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                flushed.store(true, Ordering::SeqCst);
            });
        }
        m.spawn_session(async {});

        m.shutdown();
        assert_eq!(m.drain_sessions().await, 2);
        assert!(flushed.load(Ordering::SeqCst));
        assert_eq!(m.drain_sessions().await, 0);
    }
}
