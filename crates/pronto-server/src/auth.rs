//! Connection admission: origin and transport policy, then one-time ticket
//! verification.
//!
//! Every check fails closed. A rejected client is still upgraded so it can be
//! told why with a coded close frame; browsers hide the body of a failed
//! handshake.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use pronto_core::ids::{SessionId, UserId};
use pronto_core::protocol::CloseReason;
use pronto_settings::{AuthSettings, Environment};
use pronto_store::tickets::{ticket_key, TicketRecord, TicketStore};

const WILDCARD: &str = "*";

/// Why a ticket was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("ticket not found")]
    NotFound,
    #[error("ticket payload is malformed")]
    Malformed,
    #[error("ticket has no session id")]
    MissingSessionId,
    #[error("ticket expired")]
    Expired,
    #[error("ticket store unavailable: {0}")]
    StoreUnavailable(String),
}

impl TicketError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Malformed => "MALFORMED",
            Self::MissingSessionId => "MISSING_SESSIONID",
            Self::Expired => "EXPIRED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("origin not allowed: {0}")]
    OriginBlocked(String),
    #[error("wildcard origin is not allowed in {0:?}")]
    WildcardOrigin(Environment),
    #[error("https required")]
    HttpsRequired,
    #[error("missing ticket")]
    MissingTicket,
    #[error(transparent)]
    Ticket(#[from] TicketError),
}

impl AuthError {
    /// Close frame reason sent to the rejected client.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::OriginBlocked(_) | Self::WildcardOrigin(_) => CloseReason::OriginBlocked,
            Self::HttpsRequired => CloseReason::HttpsRequired,
            Self::MissingTicket | Self::Ticket(_) => CloseReason::NotAuthorized,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::OriginBlocked(_) => "ORIGIN_BLOCKED",
            Self::WildcardOrigin(_) => "WILDCARD_ORIGIN",
            Self::HttpsRequired => "HTTPS_REQUIRED",
            Self::MissingTicket => "MISSING_TICKET",
            Self::Ticket(e) => e.reason(),
        }
    }
}

/// Claims carried by a redeemed ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketClaims {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
}

/// Redeem `ticket`. The record is deleted by the same store operation that
/// reads it, so concurrent redemptions yield exactly one success.
pub async fn verify_ticket(
    ticket: &str,
    store: &dyn TicketStore,
) -> Result<TicketClaims, TicketError> {
    let raw = store
        .take(&ticket_key(ticket))
        .await
        .map_err(|e| TicketError::StoreUnavailable(e.to_string()))?
        .ok_or(TicketError::NotFound)?;

    let record: TicketRecord = serde_json::from_str(&raw).map_err(|_| TicketError::Malformed)?;

    let session_id = record
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or(TicketError::MissingSessionId)?;

    if let Some(expires_at) = record.expires_at {
        if expires_at <= Utc::now().timestamp_millis() {
            return Err(TicketError::Expired);
        }
    }

    Ok(TicketClaims {
        session_id: SessionId::from_raw(session_id),
        user_id: record.user_id.filter(|u| !u.is_empty()).map(UserId::from_raw),
    })
}

/// Admission policy, built from [`AuthSettings`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthPolicy {
    pub environment: Environment,
    pub require_auth: bool,
    pub allowed_origins: Vec<String>,
    pub allow_missing_origin: bool,
}

impl From<&AuthSettings> for AuthPolicy {
    fn from(s: &AuthSettings) -> Self {
        Self {
            environment: s.environment,
            require_auth: s.require_auth,
            allowed_origins: s
                .allowed_origins
                .iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            allow_missing_origin: s.allow_missing_origin,
        }
    }
}

impl AuthPolicy {
    fn has_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == WILDCARD)
    }

    fn check_origin(&self, origin: Option<&str>) -> Result<(), AuthError> {
        let Some(origin) = origin.map(str::trim).filter(|o| !o.is_empty()) else {
            let test_mode = matches!(self.environment, Environment::Development | Environment::Test)
                && self.allow_missing_origin;
            return if test_mode {
                Ok(())
            } else {
                Err(AuthError::OriginBlocked("<missing>".into()))
            };
        };
        let origin = origin.trim_end_matches('/');
        if self.allowed_origins.iter().any(|o| o == origin) {
            return Ok(());
        }
        if !self.environment.is_hardened() && self.has_wildcard() {
            return Ok(());
        }
        Err(AuthError::OriginBlocked(origin.to_string()))
    }
}

/// Upgrade request facts the authenticator looks at.
#[derive(Clone, Debug, Default)]
pub struct ConnectRequest<'a> {
    pub origin: Option<&'a str>,
    /// `x-forwarded-proto` as set by the TLS-terminating proxy.
    pub forwarded_proto: Option<&'a str>,
    pub ticket: Option<&'a str>,
    /// Client-chosen session id, honoured only when auth is off.
    pub session_id: Option<&'a str>,
}

/// Identity bound to an admitted connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedClient {
    pub session_id: SessionId,
    pub user_id: Option<UserId>,
}

pub struct ConnectionAuthenticator {
    policy: AuthPolicy,
    tickets: Option<Arc<dyn TicketStore>>,
}

impl ConnectionAuthenticator {
    pub fn new(policy: AuthPolicy, tickets: Option<Arc<dyn TicketStore>>) -> Self {
        Self { policy, tickets }
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    pub fn requires_auth(&self) -> bool {
        self.policy.require_auth
    }

    pub fn ticket_store(&self) -> Option<&Arc<dyn TicketStore>> {
        self.tickets.as_ref()
    }

    /// Run the admission checks in order: transport hardening, origin, ticket.
    pub async fn verify_client(
        &self,
        req: &ConnectRequest<'_>,
    ) -> Result<AuthenticatedClient, AuthError> {
        let result = self.verify_inner(req).await;
        match &result {
            Ok(client) => debug!(session_id = %client.session_id, "client admitted"),
            Err(e) => warn!(
                code = e.code(),
                origin = req.origin.unwrap_or("<missing>"),
                "client rejected"
            ),
        }
        result
    }

    async fn verify_inner(
        &self,
        req: &ConnectRequest<'_>,
    ) -> Result<AuthenticatedClient, AuthError> {
        if self.policy.environment.is_hardened() {
            if self.policy.has_wildcard() {
                return Err(AuthError::WildcardOrigin(self.policy.environment));
            }
            let https = req
                .forwarded_proto
                .is_some_and(|p| p.trim().eq_ignore_ascii_case("https"));
            if !https {
                return Err(AuthError::HttpsRequired);
            }
        }

        self.policy.check_origin(req.origin)?;

        if !self.policy.require_auth {
            let session_id = req
                .session_id
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SessionId::from_raw)
                .unwrap_or_default();
            return Ok(AuthenticatedClient {
                session_id,
                user_id: None,
            });
        }

        let ticket = req
            .ticket
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingTicket)?;
        let store = self
            .tickets
            .as_ref()
            .ok_or_else(|| TicketError::StoreUnavailable("no ticket store configured".into()))?;
        let claims = verify_ticket(ticket, store.as_ref()).await?;
        Ok(AuthenticatedClient {
            session_id: claims.session_id,
            user_id: claims.user_id,
        })
    }
}
