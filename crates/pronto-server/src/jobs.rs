//! Job lifecycle hooks for the search pipeline.
//!
//! The pipeline owns the jobs; this module records their state, wakes pending
//! subscribers when a job starts and pushes each state change to the owner's
//! sockets.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pronto_core::ids::{RequestId, SessionId, UserId};
use pronto_core::protocol::{Channel, ServerMessage};
use pronto_core::request::{AssistantStatus, JobStatus, RequestState};
use pronto_enrich::{Dispatch, EnrichmentJob, ProviderEnrichmentWorker};
use pronto_store::RequestStateStore;

use crate::websocket::manager::WebSocketManager;
use crate::websocket::pending::ActivationSummary;

#[derive(Clone)]
pub struct JobTracker {
    manager: Arc<WebSocketManager>,
    enrichment: Option<Arc<ProviderEnrichmentWorker>>,
}

impl JobTracker {
    pub fn new(manager: Arc<WebSocketManager>) -> Self {
        Self {
            manager,
            enrichment: None,
        }
    }

    pub fn with_enrichment(mut self, worker: Arc<ProviderEnrichmentWorker>) -> Self {
        self.enrichment = Some(worker);
        self
    }

    fn states(&self) -> &RequestStateStore {
        self.manager.states()
    }

    /// Record a new RUNNING job owned by `session_id` and resolve any
    /// subscriptions that arrived before it.
    pub fn start_job(
        &self,
        request_id: RequestId,
        session_id: SessionId,
        user_id: Option<UserId>,
    ) -> ActivationSummary {
        info!(request_id = %request_id, session_id = %session_id, "job started");
        self.states()
            .set(RequestState::running(request_id.clone(), session_id, user_id));
        self.manager.activate_pending(&request_id)
    }

    pub fn update_assistant(
        &self,
        request_id: &RequestId,
        status: AssistantStatus,
    ) -> Option<RequestState> {
        let state = self.apply(request_id, |s| s.assistant_status = status)?;
        debug!(request_id = %request_id, assistant_status = ?status, "assistant status updated");
        Some(state)
    }

    /// Mark the job DONE with its core result. Subscriptions stay registered
    /// so enrichment patches can still reach the client; call
    /// [`release`](Self::release) once the pipeline is finished with the
    /// request.
    pub fn complete_job(
        &self,
        request_id: &RequestId,
        result: serde_json::Value,
    ) -> Option<RequestState> {
        let state = self.apply(request_id, |s| {
            s.status = JobStatus::Done;
            s.core_result = Some(result);
        })?;
        info!(request_id = %request_id, "job completed");
        Some(state)
    }

    /// Mark the job FAILED and release its subscriptions after delivering the
    /// final state.
    pub fn fail_job(&self, request_id: &RequestId) -> Option<RequestState> {
        let state = self.apply(request_id, |s| {
            s.status = JobStatus::Failed;
            if !s.assistant_status.is_terminal() {
                s.assistant_status = AssistantStatus::Failed;
            }
        })?;
        warn!(request_id = %request_id, "job failed");
        let _ = self.release(request_id);
        Some(state)
    }

    /// Drop every subscription for a request the pipeline is done with.
    pub fn release(&self, request_id: &RequestId) -> usize {
        self.manager.complete_request(request_id)
    }

    /// Queue a provider lookup for a running request. The owner is taken from
    /// the recorded job state; `None` if the request is unknown or no worker
    /// is configured. Requests that hit a place already being resolved still
    /// get their own `RESULT_PATCH`.
    pub async fn enrich(
        &self,
        request_id: &RequestId,
        provider_id: &str,
        place_id: &str,
        name: &str,
    ) -> Option<Dispatch> {
        let worker = self.enrichment.as_ref()?;
        let Some(state) = self.states().get(request_id) else {
            warn!(
                request_id = %request_id,
                provider_id,
                "enrichment requested for unknown request"
            );
            return None;
        };
        let job = EnrichmentJob::new(
            request_id.clone(),
            state.session_id,
            provider_id,
            place_id,
            name,
        );
        Some(worker.dispatch(job).await)
    }

    fn apply<F>(&self, request_id: &RequestId, f: F) -> Option<RequestState>
    where
        F: FnOnce(&mut RequestState),
    {
        let Some(state) = self.states().update(request_id, |s| {
            f(s);
            s.touch();
        }) else {
            debug!(request_id = %request_id, "update for unknown or expired request");
            return None;
        };
        for channel in Channel::ALL {
            let message = ServerMessage::request_state(channel, &state, false);
            let _ = self
                .manager
                .publish_to_channel(channel, request_id, &state.session_id, &message);
        }
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::{ClientConnection, Outbound};
    use crate::websocket::manager::ManagerConfig;
    use pronto_core::ids::ConnectionId;
    use pronto_core::job::JobResult;
    use pronto_enrich::mock::{MockResolve, MockResolver, RecordingCache};
    use pronto_enrich::WorkerConfig;
    use pronto_store::MemoryJobLocks;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn tracker() -> JobTracker {
        let manager = Arc::new(WebSocketManager::new(
            ManagerConfig::default(),
            Arc::new(RequestStateStore::with_defaults()),
        ));
        JobTracker::new(manager)
    }

    fn connect(
        tracker: &JobTracker,
        session: &str,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::new(),
            SessionId::from_raw(session),
            None,
            tx,
        ));
        assert!(tracker.manager.register_connection(Arc::clone(&conn)));
        (conn, rx)
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn req() -> RequestId {
        RequestId::from_raw("r1")
    }

    #[tokio::test]
    async fn start_job_activates_pending_owner() {
        let tracker = tracker();
        let (conn, mut rx) = connect(&tracker, "s1");
        let _ = tracker.manager.subscribe(Channel::Assistant, req(), &conn);

        let summary = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        assert_eq!(summary.activated, 1);
        let kinds: Vec<_> = frames(&mut rx).iter().map(|f| f["type"].clone()).collect();
        assert_eq!(kinds, vec!["sub_ack", "sub_ack", "request_state"]);
    }

    #[tokio::test]
    async fn updates_are_pushed_to_subscribers() {
        let tracker = tracker();
        let _ = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        let (conn, mut rx) = connect(&tracker, "s1");
        let _ = tracker.manager.subscribe(Channel::Assistant, req(), &conn);
        let _ = frames(&mut rx);

        let state = tracker.update_assistant(&req(), AssistantStatus::Pending).unwrap();
        assert_eq!(state.assistant_status, AssistantStatus::Pending);
        let pushed = frames(&mut rx);
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["assistantStatus"], "PENDING");
        assert_eq!(pushed[0]["replay"], false);
    }

    #[tokio::test]
    async fn complete_keeps_subscriptions_for_patches() {
        let tracker = tracker();
        let _ = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        let (conn, mut rx) = connect(&tracker, "s1");
        let _ = tracker.manager.subscribe(Channel::Search, req(), &conn);
        let _ = frames(&mut rx);

        let state = tracker
            .complete_job(&req(), serde_json::json!({"restaurants": [{"placeId": "p1"}]}))
            .unwrap();
        assert_eq!(state.status, JobStatus::Done);
        let pushed = frames(&mut rx);
        assert_eq!(pushed[0]["status"], "DONE");
        assert_eq!(pushed[0]["result"]["restaurants"][0]["placeId"], "p1");
        assert_eq!(tracker.manager.subscriber_count(Channel::Search, &req()), 1);

        assert_eq!(tracker.release(&req()), 1);
        assert_eq!(tracker.manager.subscriber_count(Channel::Search, &req()), 0);
    }

    #[tokio::test]
    async fn fail_job_pushes_then_releases() {
        let tracker = tracker();
        let _ = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        let (conn, mut rx) = connect(&tracker, "s1");
        let _ = tracker.manager.subscribe(Channel::Search, req(), &conn);
        let _ = frames(&mut rx);

        let state = tracker.fail_job(&req()).unwrap();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.assistant_status, AssistantStatus::Failed);
        assert_eq!(frames(&mut rx)[0]["status"], "FAILED");
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_gets_replay_of_completed_job() {
        let tracker = tracker();
        let _ = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        let _ = tracker.complete_job(&req(), serde_json::json!({"restaurants": []}));

        let (conn, mut rx) = connect(&tracker, "s1");
        let _ = tracker.manager.subscribe(Channel::Search, req(), &conn);
        let replay = frames(&mut rx).pop().unwrap();
        assert_eq!(replay["type"], "request_state");
        assert_eq!(replay["replay"], true);
        assert_eq!(replay["status"], "DONE");
    }

    #[tokio::test]
    async fn unknown_request_is_ignored() {
        let tracker = tracker();
        assert!(tracker.update_assistant(&req(), AssistantStatus::Completed).is_none());
        assert!(tracker.complete_job(&req(), serde_json::Value::Null).is_none());
        assert!(tracker.fail_job(&req()).is_none());
    }

    fn enrich_tracker(responses: Vec<MockResolve>) -> JobTracker {
        let manager = Arc::new(WebSocketManager::new(
            ManagerConfig::default(),
            Arc::new(RequestStateStore::with_defaults()),
        ));
        let worker = Arc::new(ProviderEnrichmentWorker::new(
            Arc::new(MockResolver::new(responses)),
            Arc::new(RecordingCache::new()),
            Arc::new(MemoryJobLocks::new()),
            Arc::clone(&manager) as Arc<dyn pronto_enrich::ResultPublisher>,
            WorkerConfig::default(),
        ));
        JobTracker::new(manager).with_enrichment(worker)
    }

    #[tokio::test]
    async fn enrich_uses_recorded_owner() {
        let tracker = enrich_tracker(vec![MockResolve::found("https://wolt.com/p1")]);
        assert!(tracker.enrich(&req(), "wolt", "p1", "Cafe").await.is_none());

        let _ = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        let (conn, mut rx) = connect(&tracker, "s1");
        let _ = tracker.manager.subscribe(Channel::Search, req(), &conn);
        let _ = frames(&mut rx);

        let Some(Dispatch::Spawned(handle)) = tracker.enrich(&req(), "wolt", "p1", "Cafe").await
        else {
            panic!("expected spawned job");
        };
        let result: JobResult = handle.await.unwrap();
        assert!(result.is_found());
        let patch = frames(&mut rx).pop().unwrap();
        assert_eq!(patch["type"], "RESULT_PATCH");
        assert_eq!(patch["patch"]["providers"]["wolt"]["url"], "https://wolt.com/p1");
    }

    #[tokio::test(start_paused = true)]
    async fn same_place_enriched_for_two_sessions_reaches_both() {
        let tracker = enrich_tracker(vec![MockResolve::delayed(
            Duration::from_secs(2),
            MockResolve::found("https://wolt.com/p1"),
        )]);
        let r2 = RequestId::from_raw("r2");
        let _ = tracker.start_job(req(), SessionId::from_raw("s1"), None);
        let _ = tracker.start_job(r2.clone(), SessionId::from_raw("s2"), None);
        let (a, mut rx_a) = connect(&tracker, "s1");
        let (b, mut rx_b) = connect(&tracker, "s2");
        let _ = tracker.manager.subscribe(Channel::Search, req(), &a);
        let _ = tracker.manager.subscribe(Channel::Search, r2.clone(), &b);
        let _ = frames(&mut rx_a);
        let _ = frames(&mut rx_b);

        let Some(Dispatch::Spawned(handle)) = tracker.enrich(&req(), "wolt", "p1", "Cafe").await
        else {
            panic!("expected spawned job");
        };
        assert!(matches!(
            tracker.enrich(&r2, "wolt", "p1", "Cafe").await,
            Some(Dispatch::Joined)
        ));
        assert!(handle.await.unwrap().is_found());

        for (rx, request) in [(&mut rx_a, "r1"), (&mut rx_b, "r2")] {
            let patches = frames(rx);
            assert_eq!(patches.len(), 1);
            assert_eq!(patches[0]["type"], "RESULT_PATCH");
            assert_eq!(patches[0]["requestId"], request);
            assert_eq!(patches[0]["patch"]["providers"]["wolt"]["status"], "FOUND");
        }
    }
}
