//! Provider result cache written by the enrichment worker.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use pronto_core::job::JobResult;

use crate::error::StoreError;

pub fn cache_key(provider_id: &str, place_id: &str) -> String {
    format!("provider:{provider_id}:{place_id}")
}

#[async_trait]
pub trait ProviderCache: Send + Sync {
    async fn put(&self, result: &JobResult, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, provider_id: &str, place_id: &str) -> Result<Option<JobResult>, StoreError>;
}

struct Cached {
    result: JobResult,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryProviderCache {
    entries: DashMap<String, Cached>,
}

impl MemoryProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaining lifetime of an entry.
    pub fn ttl_remaining(&self, provider_id: &str, place_id: &str) -> Option<Duration> {
        let entry = self.entries.get(&cache_key(provider_id, place_id))?;
        Some(entry.expires_at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl ProviderCache for MemoryProviderCache {
    async fn put(&self, result: &JobResult, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            cache_key(&result.provider_id, &result.place_id),
            Cached {
                result: result.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(
        &self,
        provider_id: &str,
        place_id: &str,
    ) -> Result<Option<JobResult>, StoreError> {
        let key = cache_key(provider_id, place_id);
        let now = Instant::now();
        if let Some(entry) = self.entries.get(&key) {
            if entry.expires_at > now {
                return Ok(Some(entry.result.clone()));
            }
        }
        self.entries.remove_if(&key, |_, e| e.expires_at <= now);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn put_get_and_expire() {
        let cache = MemoryProviderCache::new();
        let result = JobResult::found("wolt", "p1", "https://wolt.com/p1", None);
        cache.put(&result, Duration::from_secs(10)).await.unwrap();

        let hit = cache.get("wolt", "p1").await.unwrap().unwrap();
        assert_eq!(hit.url.as_deref(), Some("https://wolt.com/p1"));
        assert_eq!(cache.ttl_remaining("wolt", "p1"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("wolt", "p1").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn keyed_by_provider_and_place() {
        let cache = MemoryProviderCache::new();
        cache
            .put(&JobResult::not_found("wolt", "p1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache.get("tenbis", "p1").await.unwrap().is_none());
        assert!(cache.get("wolt", "p2").await.unwrap().is_none());
        assert_eq!(cache_key("wolt", "p1"), "provider:wolt:p1");
    }
}
