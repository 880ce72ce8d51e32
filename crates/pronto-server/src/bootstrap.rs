//! Process start-up: pick the ticket store and decide whether auth can be
//! enforced.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pronto_settings::{AuthSettings, Environment};
use pronto_store::{MemoryTicketStore, RedisTicketStore, TicketStore};

use crate::auth::AuthPolicy;

const TICKET_PURGE_INTERVAL: Duration = Duration::from_secs(60);
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("ticket store required in {environment:?} but unavailable: {cause}")]
    TicketStoreRequired { environment: Environment, cause: String },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl BootError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TicketStoreRequired { .. } => "TICKET_STORE_REQUIRED",
            Self::Bind { .. } => "BIND_FAILED",
        }
    }
}

/// Auth policy plus the ticket store backing it.
pub struct AuthSetup {
    pub policy: AuthPolicy,
    pub tickets: Option<Arc<dyn TicketStore>>,
    /// Periodic purge for the in-memory backend.
    pub purge: Option<JoinHandle<()>>,
}

/// Whether auth stays on, given the store probe result. Hardened
/// environments fail closed; elsewhere auth is switched off with a warning.
pub fn resolve_auth_mode(
    environment: Environment,
    require_auth: bool,
    probe: Result<(), String>,
) -> Result<bool, BootError> {
    if !require_auth {
        if environment.is_hardened() {
            warn!(?environment, "websocket auth disabled by configuration");
        }
        return Ok(false);
    }
    match probe {
        Ok(()) => Ok(true),
        Err(cause) if environment.is_hardened() => {
            Err(BootError::TicketStoreRequired { environment, cause })
        }
        Err(cause) => {
            warn!(?environment, %cause, "ticket store unavailable, websocket auth disabled");
            Ok(false)
        }
    }
}

async fn connect_redis(url: &str) -> Result<RedisTicketStore, String> {
    let connect = async {
        let store = RedisTicketStore::connect(url).await.map_err(|e| e.to_string())?;
        store.ping().await.map_err(|e| e.to_string())?;
        Ok(store)
    };
    tokio::time::timeout(REDIS_CONNECT_TIMEOUT, connect)
        .await
        .unwrap_or_else(|_| Err(format!("no answer within {REDIS_CONNECT_TIMEOUT:?}")))
}

/// Build the auth policy and ticket store for this process. Redis is used
/// when a URL is configured, otherwise an in-process store with a periodic
/// purge.
pub async fn prepare_auth(
    settings: &AuthSettings,
    cancel: CancellationToken,
) -> Result<AuthSetup, BootError> {
    let mut policy = AuthPolicy::from(settings);
    if !settings.require_auth {
        policy.require_auth = resolve_auth_mode(settings.environment, false, Ok(()))?;
        return Ok(AuthSetup {
            policy,
            tickets: None,
            purge: None,
        });
    }

    let Some(url) = settings.redis_url.as_deref() else {
        if settings.environment.is_hardened() {
            warn!("using in-memory ticket store; tickets are not shared across instances");
        }
        let store = Arc::new(MemoryTicketStore::new());
        let purge = spawn_ticket_purge(Arc::clone(&store), TICKET_PURGE_INTERVAL, cancel);
        info!(backend = store.backend(), "ticket store ready");
        return Ok(AuthSetup {
            policy,
            tickets: Some(store as Arc<dyn TicketStore>),
            purge: Some(purge),
        });
    };

    match connect_redis(url).await {
        Ok(store) => {
            info!(backend = store.backend(), "ticket store ready");
            Ok(AuthSetup {
                policy,
                tickets: Some(Arc::new(store) as Arc<dyn TicketStore>),
                purge: None,
            })
        }
        Err(cause) => {
            policy.require_auth = resolve_auth_mode(settings.environment, true, Err(cause))?;
            Ok(AuthSetup {
                policy,
                tickets: None,
                purge: None,
            })
        }
    }
}

/// Periodically drop expired tickets from the in-memory store.
pub fn spawn_ticket_purge(
    store: Arc<MemoryTicketStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!(purged, "expired tickets purged");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}
