//! Delivery of enrichment results to WebSocket subscribers.

use async_trait::async_trait;

use pronto_core::ids::{RequestId, SessionId};
use pronto_core::job::JobResult;
use pronto_core::protocol::{Channel, ServerMessage};
use pronto_enrich::{PublishError, ResultPublisher};

use crate::websocket::manager::WebSocketManager;

/// Result patches go out on the `search` channel, to the owner's sockets only.
#[async_trait]
impl ResultPublisher for WebSocketManager {
    async fn publish_result(
        &self,
        request_id: &RequestId,
        owner: &SessionId,
        result: &JobResult,
    ) -> Result<usize, PublishError> {
        if self.is_shut_down() {
            return Err(PublishError::Closed);
        }
        let message = ServerMessage::result_patch(request_id.clone(), result);
        Ok(self.publish_to_channel(Channel::Search, request_id, owner, &message))
    }
}
