//! WebSocket wire protocol between the realtime core and browser clients.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;
use crate::job::{JobResult, ProviderStatus};
use crate::request::{AssistantStatus, JobStatus, RequestState};

/// Version stamped on every control message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Logical topic a subscription is scoped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Search,
    Assistant,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Search, Channel::Assistant];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames a client may send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        channel: Channel,
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
    Unsubscribe {
        channel: Channel,
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
}

/// Why a subscribe attempt was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    SessionMismatch,
    RateLimited,
}

/// Per-provider entry inside a `RESULT_PATCH`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPatch {
    pub status: ProviderStatus,
    pub url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchBody {
    pub providers: BTreeMap<String, ProviderPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Frames the server sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "sub_ack")]
    SubAck {
        v: u8,
        channel: Channel,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        pending: bool,
    },
    #[serde(rename = "sub_nack")]
    SubNack {
        v: u8,
        channel: Channel,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        reason: NackReason,
    },
    /// Snapshot of buffered request state. Sent on subscribe (`replay: true`)
    /// and whenever a pipeline stage updates the request.
    #[serde(rename = "request_state")]
    RequestState {
        v: u8,
        channel: Channel,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        status: JobStatus,
        #[serde(rename = "assistantStatus")]
        assistant_status: AssistantStatus,
        result: Option<serde_json::Value>,
        replay: bool,
    },
    #[serde(rename = "error")]
    Error { v: u8, code: String, message: String },
    #[serde(rename = "RESULT_PATCH")]
    ResultPatch {
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(rename = "placeId")]
        place_id: String,
        patch: PatchBody,
    },
}

impl ServerMessage {
    pub fn sub_ack(channel: Channel, request_id: RequestId, pending: bool) -> Self {
        Self::SubAck {
            v: PROTOCOL_VERSION,
            channel,
            request_id,
            pending,
        }
    }

    pub fn sub_nack(channel: Channel, request_id: RequestId, reason: NackReason) -> Self {
        Self::SubNack {
            v: PROTOCOL_VERSION,
            channel,
            request_id,
            reason,
        }
    }

    pub fn request_state(channel: Channel, state: &RequestState, replay: bool) -> Self {
        Self::RequestState {
            v: PROTOCOL_VERSION,
            channel,
            request_id: state.request_id.clone(),
            status: state.status,
            assistant_status: state.assistant_status,
            result: state.core_result.clone(),
            replay,
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::Error {
            v: PROTOCOL_VERSION,
            code: "INVALID_MESSAGE".into(),
            message: message.into(),
        }
    }

    /// Build the client patch for one provider result.
    pub fn result_patch(request_id: RequestId, result: &JobResult) -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            result.provider_id.clone(),
            ProviderPatch {
                status: result.status,
                url: result.url.clone(),
            },
        );
        Self::ResultPatch {
            request_id,
            place_id: result.place_id.clone(),
            patch: PatchBody {
                providers,
                meta: result.meta.clone(),
            },
        }
    }

    /// Wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubAck { .. } => "sub_ack",
            Self::SubNack { .. } => "sub_nack",
            Self::RequestState { .. } => "request_state",
            Self::Error { .. } => "error",
            Self::ResultPatch { .. } => "RESULT_PATCH",
        }
    }
}

/// Machine-readable reason carried in a close frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    OriginBlocked,
    HttpsRequired,
    NotAuthorized,
    ServerShutdown,
    HeartbeatTimeout,
}

impl CloseReason {
    /// WebSocket close code (RFC 6455).
    pub fn code(self) -> u16 {
        match self {
            Self::OriginBlocked | Self::HttpsRequired | Self::NotAuthorized => 1008,
            Self::ServerShutdown | Self::HeartbeatTimeout => 1001,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OriginBlocked => "ORIGIN_BLOCKED",
            Self::HttpsRequired => "HTTPS_REQUIRED",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::ServerShutdown => "SERVER_SHUTDOWN",
            Self::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;
    use serde_json::json;

    #[test]
    fn parse_subscribe() {
        let raw = r#"{"type":"subscribe","channel":"search","requestId":"req-1"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                channel: Channel::Search,
                request_id: RequestId::from_raw("req-1"),
            }
        );
    }

    #[test]
    fn parse_unsubscribe_assistant() {
        let raw = r#"{"type":"unsubscribe","channel":"assistant","requestId":"req-2"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Unsubscribe { channel: Channel::Assistant, .. }));
    }

    #[test]
    fn unknown_channel_rejected() {
        let raw = r#"{"type":"subscribe","channel":"billing","requestId":"req-1"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let raw = r#"{"type":"publish","channel":"search","requestId":"req-1"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn sub_ack_wire_shape() {
        let msg = ServerMessage::sub_ack(Channel::Search, RequestId::from_raw("r"), true);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({
                "v": 1,
                "type": "sub_ack",
                "channel": "search",
                "requestId": "r",
                "pending": true
            })
        );
    }

    #[test]
    fn sub_nack_wire_shape() {
        let msg = ServerMessage::sub_nack(
            Channel::Assistant,
            RequestId::from_raw("r"),
            NackReason::SessionMismatch,
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({
                "v": 1,
                "type": "sub_nack",
                "channel": "assistant",
                "requestId": "r",
                "reason": "session_mismatch"
            })
        );
    }

    #[test]
    fn result_patch_wire_shape() {
        let result = JobResult::not_found("wolt", "place-9");
        let msg = ServerMessage::result_patch(RequestId::from_raw("r"), &result);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "RESULT_PATCH",
                "requestId": "r",
                "placeId": "place-9",
                "patch": {"providers": {"wolt": {"status": "NOT_FOUND", "url": null}}}
            })
        );
    }

    #[test]
    fn result_patch_carries_meta() {
        let result = JobResult::found(
            "wolt",
            "place-9",
            "https://wolt.com/x",
            Some(json!({"source": "search"})),
        );
        let msg = ServerMessage::result_patch(RequestId::from_raw("r"), &result);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["patch"]["providers"]["wolt"]["url"], "https://wolt.com/x");
        assert_eq!(v["patch"]["meta"]["source"], "search");
    }

    #[test]
    fn request_state_message_mirrors_state() {
        let mut state =
            RequestState::running(RequestId::from_raw("r"), SessionId::from_raw("s"), None);
        state.core_result = Some(json!({"restaurants": []}));
        let msg = ServerMessage::request_state(Channel::Search, &state, true);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "request_state");
        assert_eq!(v["status"], "RUNNING");
        assert_eq!(v["replay"], true);
        assert_eq!(v["result"]["restaurants"], json!([]));
        assert_eq!(msg.kind(), "request_state");
    }

    #[test]
    fn close_reason_codes() {
        assert_eq!(CloseReason::OriginBlocked.code(), 1008);
        assert_eq!(CloseReason::NotAuthorized.as_str(), "NOT_AUTHORIZED");
        assert_eq!(CloseReason::ServerShutdown.code(), 1001);
        assert_eq!(CloseReason::HeartbeatTimeout.to_string(), "HEARTBEAT_TIMEOUT");
    }
}
