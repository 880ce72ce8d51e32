use std::time::Duration;

/// Errors raised by a third-party provider lookup.
/// Classifies errors as transient (retry) or permanent (abort).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    // Transient
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),

    // Permanent
    #[error("client error {status}: {body}")]
    ClientError { status: u16, body: String },
    #[error("validation failed: {0}")]
    Validation(String),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Network(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ClientError { .. } | Self::Validation(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::ClientError { .. } => "client_error",
            Self::Validation(_) => "validation",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited { retry_after: None },
            408 => Self::Timeout(Duration::ZERO),
            500..=599 => Self::ServerError { status, body },
            _ => Self::ClientError { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(20)).is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::ServerError { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
    }

    #[test]
    fn permanent_classification() {
        assert!(ProviderError::ClientError { status: 404, body: String::new() }.is_permanent());
        assert!(ProviderError::Validation("empty place id".into()).is_permanent());
        assert!(!ProviderError::Validation("x".into()).is_transient());
    }

    #[test]
    fn cancelled_is_neither() {
        assert!(!ProviderError::Cancelled.is_transient());
        assert!(!ProviderError::Cancelled.is_permanent());
    }

    #[test]
    fn from_status_mapping() {
        assert!(ProviderError::from_status(429, "slow down".into()).is_transient());
        assert!(ProviderError::from_status(500, "boom".into()).is_transient());
        assert!(ProviderError::from_status(502, "bad gateway".into()).is_transient());
        assert!(ProviderError::from_status(400, "bad".into()).is_permanent());
        assert!(ProviderError::from_status(403, "forbidden".into()).is_permanent());
        assert!(ProviderError::from_status(408, "timeout".into()).is_transient());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ProviderError::Cancelled.error_kind(), "cancelled");
        assert_eq!(ProviderError::Network("x".into()).error_kind(), "network_error");
        assert_eq!(
            ProviderError::ClientError { status: 401, body: String::new() }.error_kind(),
            "client_error"
        );
    }
}
