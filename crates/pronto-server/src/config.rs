//! Server configuration derived from loaded settings.

use std::time::Duration;

use pronto_settings::ProntoSettings;

use crate::auth::AuthPolicy;
use crate::rate_limit::RateLimitConfig;

/// Everything the server needs at runtime, flattened from [`ProntoSettings`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` asks the OS for a free port.
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub pending_ttl: Duration,
    pub ticket_ttl: Duration,
    pub state_sweep_interval: Duration,
    pub shutdown_timeout: Duration,
    pub auth: AuthPolicy,
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ProntoSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ProntoSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_send_queue: settings.server.max_send_queue,
            heartbeat_interval: settings.websocket.heartbeat_interval(),
            pending_ttl: settings.websocket.pending_ttl(),
            ticket_ttl: settings.auth.ticket_ttl(),
            state_sweep_interval: settings.request_state.sweep_interval(),
            shutdown_timeout: settings.server.shutdown_timeout(),
            auth: AuthPolicy::from(&settings.auth),
            rate_limit: RateLimitConfig::from(&settings.rate_limit),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.max_send_queue, 256);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.pending_ttl, Duration::from_secs(90));
        assert_eq!(cfg.ticket_ttl, Duration::from_secs(30));
        assert_eq!(cfg.rate_limit.max_tokens, 10);
        assert!(cfg.auth.require_auth);
    }

    #[test]
    fn bind_addr_joins_host_and_port() {
        let mut settings = ProntoSettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        assert_eq!(ServerConfig::from_settings(&settings).bind_addr(), "127.0.0.1:0");
    }
}
