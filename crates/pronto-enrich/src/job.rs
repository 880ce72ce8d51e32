use pronto_core::errors::ProviderError;
use pronto_core::ids::{RequestId, SessionId};
use pronto_store::locks::lock_key;

/// One provider lookup for one place, on behalf of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrichmentJob {
    pub request_id: RequestId,
    /// Session that owns the request. Results are only delivered to it.
    pub owner_session_id: SessionId,
    pub provider_id: String,
    pub place_id: String,
    /// Display name used by the resolver to match a listing.
    pub name: String,
}

impl EnrichmentJob {
    pub fn new(
        request_id: RequestId,
        owner_session_id: SessionId,
        provider_id: impl Into<String>,
        place_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            owner_session_id,
            provider_id: provider_id.into(),
            place_id: place_id.into(),
            name: name.into(),
        }
    }

    pub fn lock_key(&self) -> String {
        lock_key(&self.provider_id, &self.place_id)
    }

    /// Reject jobs no resolver could answer.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.provider_id.trim().is_empty() {
            return Err(ProviderError::Validation("empty provider id".into()));
        }
        if self.place_id.trim().is_empty() {
            return Err(ProviderError::Validation("empty place id".into()));
        }
        Ok(())
    }
}
