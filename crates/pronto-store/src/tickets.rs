//! One-time WebSocket auth tickets.
//!
//! A ticket is an opaque id mapped to a small JSON record under
//! `ws_ticket:<id>`. Consumption is a single atomic fetch-and-delete on every
//! backend, so a ticket can be redeemed at most once.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use pronto_core::ids::{SessionId, UserId};

use crate::error::StoreError;

pub const TICKET_KEY_PREFIX: &str = "ws_ticket:";
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(30);

const TICKET_BYTES: usize = 32;

pub fn ticket_key(ticket: &str) -> String {
    format!("{TICKET_KEY_PREFIX}{ticket}")
}

/// Stored ticket payload. Timestamps are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Key/value backend for tickets.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch and delete in one step. `Ok(None)` if absent or expired.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn backend(&self) -> &'static str;
}

// ── Memory ──────────────────────────────────────────────────────────────────

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// Single-process ticket store for development and tests.
#[derive(Default)]
pub struct MemoryTicketStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired tickets. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .and_then(|(_, e)| (e.expires_at > now).then_some(e.value)))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ── Redis ───────────────────────────────────────────────────────────────────

/// Shared ticket store backed by Redis. The connection manager reconnects on
/// its own; each call works on a cheap clone of it.
#[derive(Clone)]
pub struct RedisTicketStore {
    conn: ConnectionManager,
}

impl RedisTicketStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("connected to redis ticket store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl TicketStore for RedisTicketStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

// ── Minting ─────────────────────────────────────────────────────────────────

/// A freshly minted ticket as returned to the HTTP caller.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTicket {
    pub ticket: String,
    pub ttl_seconds: u64,
}

fn random_ticket() -> String {
    let mut bytes = [0u8; TICKET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Mint a one-time ticket bound to `session_id` and store it with `ttl`.
pub async fn mint_ticket(
    store: &dyn TicketStore,
    session_id: &SessionId,
    user_id: Option<&UserId>,
    ttl: Duration,
) -> Result<IssuedTicket, StoreError> {
    let ticket = random_ticket();
    let now = Utc::now().timestamp_millis();
    let record = TicketRecord {
        user_id: user_id.map(|u| u.as_str().to_string()),
        session_id: Some(session_id.as_str().to_string()),
        created_at: now,
        expires_at: Some(now + ttl.as_millis() as i64),
    };
    let value = serde_json::to_string(&record)?;
    store.put(&ticket_key(&ticket), value, ttl).await?;
    debug!(session_id = %session_id, backend = store.backend(), "ticket minted");
    Ok(IssuedTicket {
        ticket,
        ttl_seconds: ttl.as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn take_is_one_shot() {
        let store = MemoryTicketStore::new();
        store.put("k", "v".into(), Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.take("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.take("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ticket_is_absent() {
        let store = MemoryTicketStore::new();
        store.put("k", "v".into(), Duration::from_secs(30)).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.take("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let store = MemoryTicketStore::new();
        store.put("old", "v".into(), Duration::from_secs(1)).await.unwrap();
        store.put("new", "v".into(), Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_takes_yield_one_winner() {
        let store = Arc::new(MemoryTicketStore::new());
        store.put("k", "v".into(), Duration::from_secs(30)).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.take("k").await.unwrap() })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;
        let winners = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn minted_ticket_round_trips_record() {
        let store = MemoryTicketStore::new();
        let session = SessionId::from_raw("sess-1");
        let user = UserId::from_raw("user-1");
        let issued = mint_ticket(&store, &session, Some(&user), DEFAULT_TICKET_TTL)
            .await
            .unwrap();

        assert_eq!(issued.ttl_seconds, 30);
        // 32 bytes, unpadded url-safe base64
        assert_eq!(issued.ticket.len(), 43);
        assert!(!issued.ticket.contains('+') && !issued.ticket.contains('/'));

        let raw = store.take(&ticket_key(&issued.ticket)).await.unwrap().unwrap();
        let record: TicketRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.session_id.as_deref(), Some("sess-1"));
        assert_eq!(record.user_id.as_deref(), Some("user-1"));
        assert_eq!(record.expires_at, Some(record.created_at + 30_000));
    }

    #[tokio::test]
    async fn minted_tickets_are_distinct() {
        let store = MemoryTicketStore::new();
        let session = SessionId::from_raw("s");
        let a = mint_ticket(&store, &session, None, DEFAULT_TICKET_TTL).await.unwrap();
        let b = mint_ticket(&store, &session, None, DEFAULT_TICKET_TTL).await.unwrap();
        assert_ne!(a.ticket, b.ticket);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn record_wire_shape() {
        let record = TicketRecord {
            user_id: None,
            session_id: Some("s".into()),
            created_at: 1,
            expires_at: Some(2),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v, serde_json::json!({"sessionId": "s", "createdAt": 1, "expiresAt": 2}));
        assert_eq!(ticket_key("abc"), "ws_ticket:abc");
    }
}
