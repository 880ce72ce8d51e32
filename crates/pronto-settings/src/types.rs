//! Typed settings sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Deployment environment. Staging and production harden the auth policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Staging,
    Production,
}

impl Environment {
    /// Whether the fail-closed origin/HTTPS policy applies.
    pub fn is_hardened(self) -> bool {
        matches!(self, Self::Staging | Self::Production)
    }

    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "development" | "dev" | "local" => Some(Self::Development),
            "test" => Some(Self::Test),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Top-level settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProntoSettings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub websocket: WebSocketSettings,
    pub rate_limit: RateLimitSettings,
    pub request_state: RequestStateSettings,
    pub enrichment: EnrichmentSettings,
}

impl ProntoSettings {
    /// Reject values that would make a service misbehave (zero intervals,
    /// empty buckets).
    pub fn validate(&self) -> Result<()> {
        if self.websocket.heartbeat_interval_ms == 0 {
            return Err(SettingsError::invalid("websocket.heartbeatIntervalMs", "must be positive"));
        }
        if self.rate_limit.max_tokens == 0 {
            return Err(SettingsError::invalid("rateLimit.maxTokens", "must be positive"));
        }
        if self.rate_limit.refill_interval_ms == 0 {
            return Err(SettingsError::invalid("rateLimit.refillIntervalMs", "must be positive"));
        }
        if self.request_state.sweep_interval_secs == 0 {
            return Err(SettingsError::invalid(
                "requestState.sweepIntervalSecs",
                "must be positive",
            ));
        }
        if self.enrichment.attempt_timeout_ms > self.enrichment.job_timeout_ms {
            return Err(SettingsError::invalid(
                "enrichment.attemptTimeoutMs",
                "must not exceed jobTimeoutMs",
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
    /// Hard bound on orderly shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            max_send_queue: 256,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Connection admission policy and ticket store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub environment: Environment,
    pub require_auth: bool,
    pub allowed_origins: Vec<String>,
    /// Accept origin-less connections. Honoured only in development/test.
    pub allow_missing_origin: bool,
    pub ticket_ttl_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            require_auth: true,
            allowed_origins: vec!["http://localhost:4200".into()],
            allow_missing_origin: false,
            ticket_ttl_secs: 30,
            redis_url: None,
        }
    }
}

impl AuthSettings {
    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    pub heartbeat_interval_ms: u64,
    pub pending_ttl_secs: u64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            pending_ttl_secs: 90,
        }
    }
}

impl WebSocketSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

/// Token bucket for subscribe attempts: `refill_rate` tokens arrive every
/// `refill_interval_ms`, capped at `max_tokens`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub max_tokens: u32,
    pub refill_rate: f64,
    pub refill_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_rate: 10.0,
            refill_interval_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestStateSettings {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RequestStateSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl RequestStateSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Provider enrichment worker budgets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnrichmentSettings {
    pub job_timeout_ms: u64,
    pub attempt_timeout_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub found_ttl_secs: u64,
    pub not_found_ttl_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver_url: Option<String>,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            job_timeout_ms: 30_000,
            attempt_timeout_ms: 20_000,
            max_retries: 2,
            base_backoff_ms: 1_000,
            found_ttl_secs: 86_400,
            not_found_ttl_secs: 3_600,
            resolver_url: None,
        }
    }
}
