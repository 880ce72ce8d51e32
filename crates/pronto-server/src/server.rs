//! `ProntoServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use pronto_core::ids::{ConnectionId, SessionId, UserId};
use pronto_core::protocol::CloseReason;
use pronto_enrich::ProviderEnrichmentWorker;
use pronto_store::{mint_ticket, IssuedTicket, RequestStateStore, TicketStore};

use crate::auth::{AuthPolicy, ConnectRequest, ConnectionAuthenticator};
use crate::bootstrap::BootError;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::jobs::JobTracker;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::manager::{ManagerConfig, WebSocketManager};
use crate::websocket::session::{reject_socket, run_ws_session};

const SESSION_HEADER: &str = "x-session-id";
const USER_HEADER: &str = "x-user-id";
const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WebSocketManager>,
    pub authenticator: Arc<ConnectionAuthenticator>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    pub ticket_ttl: Duration,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
}

/// The realtime server: routes, registries and background tasks.
pub struct ProntoServer {
    config: ServerConfig,
    states: Arc<RequestStateStore>,
    manager: Arc<WebSocketManager>,
    authenticator: Arc<ConnectionAuthenticator>,
    shutdown: Arc<ShutdownCoordinator>,
    jobs: JobTracker,
    enrichment: Option<Arc<ProviderEnrichmentWorker>>,
    start_time: Instant,
}

/// Returned by [`ProntoServer::listen`]; owns the accept loop task.
pub struct ServerHandle {
    pub addr: SocketAddr,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl ProntoServer {
    pub fn new(
        config: ServerConfig,
        states: Arc<RequestStateStore>,
        tickets: Option<Arc<dyn TicketStore>>,
    ) -> Self {
        let manager = Arc::new(WebSocketManager::new(
            ManagerConfig::from(&config),
            Arc::clone(&states),
        ));
        let authenticator = Arc::new(ConnectionAuthenticator::new(config.auth.clone(), tickets));
        Self {
            jobs: JobTracker::new(Arc::clone(&manager)),
            config,
            states,
            manager,
            authenticator,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            enrichment: None,
            start_time: Instant::now(),
        }
    }

    /// Route enrichment through `worker`. The worker should publish through
    /// [`manager`](Self::manager).
    pub fn attach_enrichment(&mut self, worker: Arc<ProviderEnrichmentWorker>) {
        self.jobs =
            JobTracker::new(Arc::clone(&self.manager)).with_enrichment(Arc::clone(&worker));
        self.enrichment = Some(worker);
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: Arc::clone(&self.manager),
            authenticator: Arc::clone(&self.authenticator),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            ticket_ttl: self.config.ticket_ttl,
            max_send_queue: self.config.max_send_queue,
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/ws-ticket", post(ticket_handler))
            .layer(cors_layer(&self.config.auth))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<WebSocketManager> {
        &self.manager
    }

    pub fn states(&self) -> &Arc<RequestStateStore> {
        &self.states
    }

    pub fn authenticator(&self) -> &Arc<ConnectionAuthenticator> {
        &self.authenticator
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Job lifecycle hooks for the search pipeline.
    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Bind, start the heartbeat and the state sweeper, and serve until the
    /// shutdown token fires.
    pub async fn listen(&self) -> Result<ServerHandle, BootError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| BootError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BootError::Bind { addr, source })?;

        self.manager.start_heartbeat();
        self.states.start_sweeper(self.config.state_sweep_interval);

        let router = self.router();
        let token = self.shutdown.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "server exited with error");
            }
        });

        info!(addr = %local_addr, auth = self.authenticator.requires_auth(), "listening");
        Ok(ServerHandle {
            addr: local_addr,
            server,
        })
    }

    /// Stop accepting, close every socket with `SERVER_SHUTDOWN`, mark
    /// in-flight jobs FAILED, then drain the accept loop and every session
    /// task, bounded by the configured timeout. Returns `false` if the drain
    /// timed out.
    pub async fn shutdown_gracefully(&self, handle: ServerHandle) -> bool {
        info!("shutting down");
        self.shutdown.shutdown();
        if let Some(worker) = &self.enrichment {
            worker.shutdown();
        }
        self.manager.shutdown();
        let failed = self.states.fail_running();
        if failed > 0 {
            warn!(failed, "in-flight jobs marked failed");
        }
        let manager = Arc::clone(&self.manager);
        let sessions = tokio::spawn(async move {
            let _ = manager.drain_sessions().await;
        });
        let drained = self
            .shutdown
            .graceful_shutdown(vec![handle.server, sessions], Some(self.config.shutdown_timeout))
            .await;
        self.states.shutdown();
        info!(drained, "shutdown complete");
        drained
    }
}

fn cors_layer(policy: &AuthPolicy) -> CorsLayer {
    let origins: Vec<HeaderValue> = policy
        .allowed_origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    let wildcard = policy.allowed_origins.iter().any(|o| o == "*");
    let allow_origin = if wildcard && !policy.environment.is_hardened() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static(USER_HEADER),
        ])
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.manager.connection_count(),
        state.manager.pending_count(),
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    ticket: Option<String>,
    session_id: Option<String>,
}

/// GET /ws. Admission runs before the upgrade; failures are reported by
/// upgrading and closing with the coded reason.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let request = ConnectRequest {
        origin: header_str(&headers, header::ORIGIN.as_str()),
        forwarded_proto: header_str(&headers, FORWARDED_PROTO_HEADER),
        ticket: query.ticket.as_deref(),
        session_id: query.session_id.as_deref(),
    };
    let admission = if state.shutdown.is_shutting_down() {
        Err(CloseReason::ServerShutdown)
    } else {
        state
            .authenticator
            .verify_client(&request)
            .await
            .map_err(|e| e.close_reason())
    };

    ws.on_upgrade(move |socket| async move {
        let manager = Arc::clone(&state.manager);
        match admission {
            Ok(client) => manager.spawn_session(run_ws_session(
                socket,
                ConnectionId::new(),
                client,
                state.manager,
                state.max_send_queue,
            )),
            Err(reason) => manager.spawn_session(reject_socket(socket, reason)),
        }
    })
}

/// Error body for the HTTP endpoints.
#[derive(Debug)]
enum ApiError {
    BadRequest(&'static str),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m.to_string()),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", m),
        };
        (status, Json(serde_json::json!({ "error": code, "message": message }))).into_response()
    }
}

/// POST /ws-ticket. Mints a one-time ticket for the caller's session.
async fn ticket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IssuedTicket>, ApiError> {
    let store = state
        .authenticator
        .ticket_store()
        .ok_or_else(|| ApiError::Unavailable("ticket store not configured".into()))?;
    let session_id = header_str(&headers, SESSION_HEADER)
        .map(SessionId::from_raw)
        .ok_or(ApiError::BadRequest("x-session-id header required"))?;
    let user_id = header_str(&headers, USER_HEADER).map(UserId::from_raw);

    let issued = mint_ticket(store.as_ref(), &session_id, user_id.as_ref(), state.ticket_ttl)
        .await
        .map_err(|e| {
            warn!(error = %e, session_id = %session_id, "failed to mint ticket");
            ApiError::Unavailable("ticket store unavailable".into())
        })?;
    Ok(Json(issued))
}
