//! Advisory locks that keep two workers off the same provider/place pair.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;

pub fn lock_key(provider_id: &str, place_id: &str) -> String {
    format!("lock:provider:{provider_id}:{place_id}")
}

#[async_trait]
pub trait JobLocks: Send + Sync {
    /// Take the lock if free or expired. `Ok(false)` when someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryJobLocks {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryJobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now())
    }
}

#[async_trait]
impl JobLocks for MemoryJobLocks {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut held = self.held.lock();
        match held.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                held.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.held.lock().remove(key);
        Ok(())
    }
}
