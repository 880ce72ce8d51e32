use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a provider lookup for one place.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Found,
    NotFound,
}

impl ProviderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Found => "FOUND",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

/// Terminal result of a single enrichment job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub provider_id: String,
    pub place_id: String,
    pub url: Option<String>,
    pub status: ProviderStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl JobResult {
    pub fn found(
        provider_id: impl Into<String>,
        place_id: impl Into<String>,
        url: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            place_id: place_id.into(),
            url: Some(url.into()),
            status: ProviderStatus::Found,
            updated_at: Utc::now(),
            meta,
        }
    }

    pub fn not_found(provider_id: impl Into<String>, place_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            place_id: place_id.into(),
            url: None,
            status: ProviderStatus::NotFound,
            updated_at: Utc::now(),
            meta: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == ProviderStatus::Found
    }
}
