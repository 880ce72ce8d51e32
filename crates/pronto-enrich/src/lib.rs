//! Provider enrichment: resolve a place against a third-party delivery
//! provider, cache the outcome and publish it to the owning session.

pub mod job;
pub mod publisher;
pub mod resolver;
pub mod retry;
pub mod worker;

pub mod mock;

pub use job::EnrichmentJob;
pub use publisher::{PublishError, ResultPublisher};
pub use resolver::{HttpProviderResolver, Listing, ProviderResolver};
pub use retry::RetryPolicy;
pub use worker::{Dispatch, JobPhase, ProviderEnrichmentWorker, WorkerConfig};
