use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, SessionId, UserId};

/// Lifecycle of a search job as seen by the realtime core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Running,
    Done,
    Failed,
}

/// Progress of the assistant narration attached to a search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssistantStatus {
    #[default]
    Idle,
    Pending,
    Completed,
    Failed,
}

impl AssistantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Buffered per-request state. Doubles as the job-owner record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestState {
    pub request_id: RequestId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub status: JobStatus,
    #[serde(default)]
    pub core_result: Option<serde_json::Value>,
    #[serde(default)]
    pub assistant_status: AssistantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestState {
    /// A freshly started job owned by `session_id`.
    pub fn running(request_id: RequestId, session_id: SessionId, user_id: Option<UserId>) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            session_id,
            user_id,
            status: JobStatus::Running,
            core_result: None,
            assistant_status: AssistantStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn is_owned_by(&self, session_id: &SessionId) -> bool {
        &self.session_id == session_id
    }

    /// Bump `updated_at`. Callers use this after any field change.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
