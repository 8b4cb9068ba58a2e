use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a parent/child relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubSessionStatus {
    /// Child is producing messages.
    Active,
    /// Quiet past the inactivity threshold; waiting for confirmation.
    Completing,
    /// Confirmed done; result extracted, delivery pending.
    Completed,
    /// Result delivered into the parent.
    Returned,
    /// Parent vanished before delivery.
    Orphaned,
    Error,
}

impl SubSessionStatus {
    /// No further monitoring happens in these states.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Returned | Self::Orphaned | Self::Error)
    }

    pub const fn is_monitored(self) -> bool {
        matches!(self, Self::Active | Self::Completing)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Returned => "returned",
            Self::Orphaned => "orphaned",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SubSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked child session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubSessionRelation {
    pub child_session_id: String,
    pub parent_session_id: String,
    /// Id of the spawn-tool invocation that created the child, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_tool_id: Option<String>,
    pub status: SubSessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completing_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
    pub message_count: usize,
    /// Child's last assistant message, possibly truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubSessionRelation {
    pub(crate) fn new(
        child: String,
        parent: String,
        spawn_tool_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            child_session_id: child,
            parent_session_id: parent,
            spawn_tool_id,
            status: SubSessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            completing_since: None,
            returned_at: None,
            message_count: 0,
            output: None,
            error: None,
        }
    }
}

/// Options for [`register_sub_session`](super::SubSessionTracker::register_sub_session).
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub spawn_tool_id: Option<String>,
}

/// Tracker event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SubSessionEvent {
    Registered {
        child_session_id: String,
        parent_session_id: String,
        spawn_tool_id: Option<String>,
    },
    StatusChanged {
        child_session_id: String,
        parent_session_id: String,
        from: SubSessionStatus,
        to: SubSessionStatus,
    },
    /// A spawn-tool call was seen in a watched parent.
    SpawnDetected {
        parent_session_id: String,
        spawn_tool_id: String,
    },
    Unregistered {
        child_session_id: String,
    },
}

/// Errors from the sub-session tracker.
#[derive(Debug, thiserror::Error)]
pub enum SubSessionError {
    #[error("Session cannot be its own parent: {id}")]
    SelfParent { id: String },

    #[error("Sub-session already registered: {child}")]
    AlreadyRegistered { child: String },

    #[error("Sub-session not found: {child}")]
    NotFound { child: String },

    #[error("Cannot return sub-session {child} in status {status}")]
    InvalidState {
        child: String,
        status: SubSessionStatus,
    },

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),
}
