use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use pronto_core::errors::ProviderError;

use crate::job::EnrichmentJob;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A provider listing matched to a place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Looks a place up on a third-party provider.
///
/// `Ok(None)` is a definitive "no listing" answer and is never retried.
/// Implementations should stop work once `cancel` fires; the worker also drops
/// the future on timeout, so nothing returned after that is observed.
#[async_trait]
pub trait ProviderResolver: Send + Sync {
    async fn resolve(
        &self,
        job: &EnrichmentJob,
        cancel: CancellationToken,
    ) -> Result<Option<Listing>, ProviderError>;
}

#[derive(Deserialize)]
struct ResolveResponse {
    url: Option<String>,
    #[serde(default)]
    meta: Option<serde_json::Value>,
}

/// Resolver that calls an HTTP lookup service:
/// `GET {base}/resolve?provider=..&placeId=..&name=..`.
pub struct HttpProviderResolver {
    client: Client,
    base_url: String,
}

impl HttpProviderResolver {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn fetch(&self, job: &EnrichmentJob) -> Result<Option<Listing>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/resolve", self.base_url))
            .query(&[
                ("provider", job.provider_id.as_str()),
                ("placeId", job.place_id.as_str()),
                ("name", job.name.as_str()),
            ])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(match ProviderError::from_status(status.as_u16(), body) {
                ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after },
                other => other,
            });
        }

        let body: ResolveResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Validation(format!("invalid resolver response: {e}")))?;
        Ok(body.url.filter(|u| !u.is_empty()).map(|url| Listing {
            url,
            meta: body.meta,
        }))
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(Duration::ZERO)
    } else {
        ProviderError::Network(e.to_string())
    }
}

#[async_trait]
impl ProviderResolver for HttpProviderResolver {
    #[instrument(skip_all, fields(provider_id = %job.provider_id, place_id = %job.place_id))]
    async fn resolve(
        &self,
        job: &EnrichmentJob,
        cancel: CancellationToken,
    ) -> Result<Option<Listing>, ProviderError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("resolve cancelled");
                Err(ProviderError::Cancelled)
            }
            result = self.fetch(job) => result,
        }
    }
}
