use async_trait::async_trait;

use pronto_core::ids::{RequestId, SessionId};
use pronto_core::job::JobResult;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("publisher is shut down")]
    Closed,
    #[error("publish failed: {0}")]
    Failed(String),
}

/// Sink for finished enrichment results. The realtime layer implements this
/// and fans the result out to subscribers owned by `owner_session_id`.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Returns how many sockets the result was delivered to.
    async fn publish_result(
        &self,
        request_id: &RequestId,
        owner_session_id: &SessionId,
        result: &JobResult,
    ) -> Result<usize, PublishError>;
}
