//! Shared types for the Pronto realtime core: branded ids, the WebSocket wire
//! protocol, request/job state, and the provider error taxonomy.

pub mod errors;
pub mod ids;
pub mod job;
pub mod protocol;
pub mod request;

pub use errors::ProviderError;
pub use ids::{ConnectionId, RequestId, SessionId, UserId};
pub use job::{JobResult, ProviderStatus};
pub use protocol::{
    Channel, ClientMessage, CloseReason, NackReason, ServerMessage, PROTOCOL_VERSION,
};
pub use request::{AssistantStatus, JobStatus, RequestState};
