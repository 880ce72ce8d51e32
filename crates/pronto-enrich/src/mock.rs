//! Scripted collaborators for exercising the worker without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use pronto_core::errors::ProviderError;
use pronto_core::ids::{RequestId, SessionId};
use pronto_core::job::JobResult;
use pronto_store::{ProviderCache, StoreError};

use crate::job::EnrichmentJob;
use crate::publisher::{PublishError, ResultPublisher};
use crate::resolver::{Listing, ProviderResolver};

/// Pre-programmed resolver answers, consumed in order.
pub enum MockResolve {
    Listing(Listing),
    NoListing,
    Error(ProviderError),
    /// Never answer; only cancellation ends the call.
    Hang,
    Delay(Duration, Box<MockResolve>),
}

impl MockResolve {
    pub fn found(url: &str) -> Self {
        Self::Listing(Listing {
            url: url.to_string(),
            meta: None,
        })
    }

    pub fn server_error() -> Self {
        Self::Error(ProviderError::ServerError {
            status: 503,
            body: "unavailable".into(),
        })
    }

    pub fn delayed(delay: Duration, inner: MockResolve) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

pub struct MockResolver {
    responses: Mutex<Vec<MockResolve>>,
    call_count: AtomicUsize,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl MockResolver {
    pub fn new(mut responses: Vec<MockResolve>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            call_count: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Cancellation tokens handed to each call, in call order.
    pub fn tokens(&self) -> Vec<CancellationToken> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl ProviderResolver for MockResolver {
    async fn resolve(
        &self,
        _job: &EnrichmentJob,
        cancel: CancellationToken,
    ) -> Result<Option<Listing>, ProviderError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().push(cancel.clone());
        let mut next = self
            .responses
            .lock()
            .pop()
            .unwrap_or(MockResolve::Error(ProviderError::Validation(
                "no more mock responses".into(),
            )));
        loop {
            match next {
                MockResolve::Listing(listing) => return Ok(Some(listing)),
                MockResolve::NoListing => return Ok(None),
                MockResolve::Error(e) => return Err(e),
                MockResolve::Hang => {
                    cancel.cancelled().await;
                    return Err(ProviderError::Cancelled);
                }
                MockResolve::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    next = *inner;
                }
            }
        }
    }
}

/// Cache that records every write.
#[derive(Default)]
pub struct RecordingCache {
    writes: Mutex<Vec<(JobResult, Duration)>>,
    fail_writes: bool,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail_writes: true,
        }
    }

    pub fn writes(&self) -> Vec<(JobResult, Duration)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl ProviderCache for RecordingCache {
    async fn put(&self, result: &JobResult, ttl: Duration) -> Result<(), StoreError> {
        self.writes.lock().push((result.clone(), ttl));
        if self.fail_writes {
            return Err(StoreError::Unavailable("cache offline".into()));
        }
        Ok(())
    }

    async fn get(
        &self,
        provider_id: &str,
        place_id: &str,
    ) -> Result<Option<JobResult>, StoreError> {
        Ok(self
            .writes
            .lock()
            .iter()
            .rev()
            .find(|(r, _)| r.provider_id == provider_id && r.place_id == place_id)
            .map(|(r, _)| r.clone()))
    }
}

/// Publisher that records every published result.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(RequestId, SessionId, JobResult)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(RequestId, SessionId, JobResult)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish_result(
        &self,
        request_id: &RequestId,
        owner_session_id: &SessionId,
        result: &JobResult,
    ) -> Result<usize, PublishError> {
        self.published
            .lock()
            .push((request_id.clone(), owner_session_id.clone(), result.clone()));
        Ok(1)
    }
}
