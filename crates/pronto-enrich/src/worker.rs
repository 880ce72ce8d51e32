//! Provider enrichment worker.
//!
//! One job moves through `STARTED -> RESOLVING -> CACHE_WRITE -> PUBLISHED ->
//! DONE`, or ends in `FAILED`. Two nested budgets bound it: the job timeout
//! wraps the whole attempt sequence and the attempt timeout wraps a single
//! resolver call. A failed job still produces a NOT_FOUND result so the
//! client never waits on a placeholder forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use pronto_core::errors::ProviderError;
use pronto_core::job::{JobResult, ProviderStatus};
use pronto_settings::EnrichmentSettings;
use pronto_store::{JobLocks, ProviderCache};

use crate::job::EnrichmentJob;
use crate::publisher::ResultPublisher;
use crate::resolver::{Listing, ProviderResolver};
use crate::retry::RetryPolicy;

/// How often a job blocked on a lock held elsewhere re-checks the cache.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub job_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub found_ttl: Duration,
    pub not_found_ttl: Duration,
    /// Advisory lock lifetime. Outlives the job budget so a crashed worker's
    /// lock still frees itself.
    pub lock_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&EnrichmentSettings::default())
    }
}

impl From<&EnrichmentSettings> for WorkerConfig {
    fn from(s: &EnrichmentSettings) -> Self {
        let job_timeout = Duration::from_millis(s.job_timeout_ms);
        Self {
            job_timeout,
            attempt_timeout: Duration::from_millis(s.attempt_timeout_ms),
            retry: RetryPolicy {
                max_retries: s.max_retries,
                base_delay: Duration::from_millis(s.base_backoff_ms),
                ..RetryPolicy::default()
            },
            found_ttl: Duration::from_secs(s.found_ttl_secs),
            not_found_ttl: Duration::from_secs(s.not_found_ttl_secs),
            lock_ttl: job_timeout + Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn ttl_for(&self, status: ProviderStatus) -> Duration {
        match status {
            ProviderStatus::Found => self.found_ttl,
            ProviderStatus::NotFound => self.not_found_ttl,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Started,
    Resolving,
    CacheWrite,
    Published,
    Done,
    Failed,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Resolving => "RESOLVING",
            Self::CacheWrite => "CACHE_WRITE",
            Self::Published => "PUBLISHED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

/// Outcome of handing a job to the worker.
#[derive(Debug)]
pub enum Dispatch {
    /// A fresh cached result was republished; no lookup ran.
    Cached(JobResult),
    Spawned(JoinHandle<JobResult>),
    /// A job for the same provider/place is already running here. Its result
    /// is published to this request as well.
    Joined,
    /// The lock is held by a worker this process does not own. The task
    /// publishes the holder's cached result once it lands, or runs the lookup
    /// itself if the lock frees without one.
    Following(JoinHandle<JobResult>),
}

pub struct ProviderEnrichmentWorker {
    resolver: Arc<dyn ProviderResolver>,
    cache: Arc<dyn ProviderCache>,
    locks: Arc<dyn JobLocks>,
    publisher: Arc<dyn ResultPublisher>,
    config: WorkerConfig,
    cancel: CancellationToken,
    total_retries: AtomicU64,
    /// Jobs waiting on an in-flight lookup, keyed by lock key. An entry exists
    /// exactly while this worker runs a locked job for that key.
    followers: Mutex<HashMap<String, Vec<EnrichmentJob>>>,
}

impl ProviderEnrichmentWorker {
    pub fn new(
        resolver: Arc<dyn ProviderResolver>,
        cache: Arc<dyn ProviderCache>,
        locks: Arc<dyn JobLocks>,
        publisher: Arc<dyn ResultPublisher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            resolver,
            cache,
            locks,
            publisher,
            config,
            cancel: CancellationToken::new(),
            total_retries: AtomicU64::new(0),
            followers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Serve from cache if possible, otherwise take the advisory lock and run
    /// the job on its own task. A job that finds the lock taken still gets a
    /// result: it joins the running lookup or follows the remote holder.
    pub async fn dispatch(self: &Arc<Self>, job: EnrichmentJob) -> Dispatch {
        match self.cache.get(&job.provider_id, &job.place_id).await {
            Ok(Some(cached)) => {
                debug!(
                    request_id = %job.request_id,
                    provider_id = %job.provider_id,
                    "enrichment cache hit"
                );
                self.publish(&job, &cached).await;
                return Dispatch::Cached(cached);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cache read failed, resolving"),
        }

        let key = job.lock_key();
        match self.locks.try_acquire(&key, self.config.lock_ttl).await {
            Ok(true) => {
                self.followers.lock().insert(key, Vec::new());
            }
            Ok(false) => {
                if let Some(waiting) = self.followers.lock().get_mut(&key) {
                    debug!(
                        lock_key = %key,
                        request_id = %job.request_id,
                        "joined running enrichment"
                    );
                    waiting.push(job);
                    return Dispatch::Joined;
                }
                debug!(lock_key = %key, "lock held elsewhere, following");
                let worker = Arc::clone(self);
                return Dispatch::Following(tokio::spawn(async move {
                    worker.follow_locked(&job).await
                }));
            }
            // Run unlocked rather than drop the job.
            Err(e) => warn!(error = %e, "lock acquire failed, running unlocked"),
        }

        let worker = Arc::clone(self);
        Dispatch::Spawned(tokio::spawn(async move { worker.process_job(&job).await }))
    }

    /// Wait out a lock held by another worker. Publishes the holder's cached
    /// result, takes over if the lock frees with nothing cached, and gives up
    /// with NOT_FOUND once the lock lifetime has passed.
    async fn follow_locked(&self, job: &EnrichmentJob) -> JobResult {
        let deadline = Instant::now() + self.config.lock_ttl;
        loop {
            tokio::select! {
                () = tokio::time::sleep(LOCK_POLL_INTERVAL) => {}
                () = self.cancel.cancelled() => break,
            }
            match self.cache.get(&job.provider_id, &job.place_id).await {
                Ok(Some(cached)) => {
                    self.publish(job, &cached).await;
                    return cached;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "cache read failed while following lock"),
            }
            if let Ok(true) = self.locks.try_acquire(&job.lock_key(), self.config.lock_ttl).await {
                self.followers.lock().insert(job.lock_key(), Vec::new());
                return self.process_job(job).await;
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        warn!(lock_key = %job.lock_key(), "gave up waiting on lock, recording NOT_FOUND");
        let result = JobResult::not_found(&job.provider_id, &job.place_id);
        self.publish(job, &result).await;
        result
    }

    /// Run one job to completion. Always yields a result; failures become
    /// NOT_FOUND.
    #[instrument(
        skip_all,
        fields(
            request_id = %job.request_id,
            provider_id = %job.provider_id,
            place_id = %job.place_id
        )
    )]
    pub async fn process_job(&self, job: &EnrichmentJob) -> JobResult {
        let started = Instant::now();
        debug!(phase = JobPhase::Started.as_str(), "enrichment job started");

        let budget = self.config.job_timeout;
        let outcome = match job.validate() {
            Err(e) => Err(e),
            Ok(()) => match tokio::time::timeout(budget, self.resolve_with_retry(job)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(budget)),
            },
        };

        let result = match outcome {
            Ok(Some(Listing { url, meta })) => {
                JobResult::found(&job.provider_id, &job.place_id, url, meta)
            }
            Ok(None) => JobResult::not_found(&job.provider_id, &job.place_id),
            Err(e) => {
                warn!(
                    phase = JobPhase::Failed.as_str(),
                    error_kind = e.error_kind(),
                    error = %e,
                    "enrichment failed, recording NOT_FOUND"
                );
                JobResult::not_found(&job.provider_id, &job.place_id)
            }
        };

        self.write_cache(&result).await;
        self.publish(job, &result).await;
        let followers = self.followers.lock().remove(&job.lock_key()).unwrap_or_default();
        for follower in &followers {
            self.publish(follower, &result).await;
        }
        self.release_lock(job).await;

        info!(
            phase = JobPhase::Done.as_str(),
            status = result.status.as_str(),
            followers = followers.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "enrichment job finished"
        );
        result
    }

    async fn resolve_with_retry(
        &self,
        job: &EnrichmentJob,
    ) -> Result<Option<Listing>, ProviderError> {
        let mut attempt = 0;
        loop {
            debug!(phase = JobPhase::Resolving.as_str(), attempt, "resolving");
            let token = self.cancel.child_token();
            let outcome = match tokio::time::timeout(
                self.config.attempt_timeout,
                self.resolver.resolve(job, token.clone()),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(self.config.attempt_timeout)),
            };
            // The attempt future is gone either way; cancel anything it spawned.
            token.cancel();

            let err = match outcome {
                Ok(listing) => return Ok(listing),
                Err(e) => e,
            };
            if !self.config.retry.should_retry(attempt, &err) {
                return Err(err);
            }

            let delay = self.config.retry.delay_for(attempt, &err);
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt = attempt + 1,
                max_retries = self.config.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error_kind = err.error_kind(),
                "retrying provider lookup"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
            attempt += 1;
        }
    }

    async fn write_cache(&self, result: &JobResult) {
        let ttl = self.config.ttl_for(result.status);
        debug!(phase = JobPhase::CacheWrite.as_str(), ttl_secs = ttl.as_secs(), "writing cache");
        if let Err(e) = self.cache.put(result, ttl).await {
            warn!(error = %e, "cache write failed");
        }
    }

    async fn publish(&self, job: &EnrichmentJob, result: &JobResult) {
        match self
            .publisher
            .publish_result(&job.request_id, &job.owner_session_id, result)
            .await
        {
            Ok(delivered) => {
                debug!(phase = JobPhase::Published.as_str(), delivered, "result published");
            }
            Err(e) => warn!(error = %e, "publish failed"),
        }
    }

    async fn release_lock(&self, job: &EnrichmentJob) {
        if let Err(e) = self.locks.release(&job.lock_key()).await {
            warn!(lock_key = %job.lock_key(), error = %e, "lock release failed");
        }
    }

    /// Cancel every in-flight attempt and backoff. Running jobs finish as
    /// NOT_FOUND.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
