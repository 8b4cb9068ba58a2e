//! Broadcast event types.

use serde::Serialize;

use crate::subsession::SubSessionEvent;

use super::tools::ToolUsage;
use super::types::{OrchestrationStatus, Phase, WorkerStatus};

/// Capacity of every component's broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something happened to one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEvent {
    pub orchestration_id: String,
    pub task_id: String,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEventKind {
    Queued,
    Spawned,
    Progress {
        progress: f64,
        current_action: Option<String>,
        tools: ToolUsage,
    },
    StatusChanged {
        from: WorkerStatus,
        to: WorkerStatus,
        error: Option<String>,
    },
    /// A new attempt was queued for the task.
    Retrying {
        previous_session_id: String,
        attempt: u32,
    },
}

impl WorkerEvent {
    /// Whether the worker reached a terminal status with this event.
    pub fn is_terminal(&self) -> bool {
        matches!(&self.kind, WorkerEventKind::StatusChanged { to, .. } if to.is_terminal())
    }
}

/// Orchestrator-level event stream. Worker and sub-session events are
/// forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Created {
        orchestration_id: String,
    },
    StatusChanged {
        orchestration_id: String,
        from: OrchestrationStatus,
        to: OrchestrationStatus,
        phase: Phase,
    },
    TasksReady {
        orchestration_id: String,
        task_count: usize,
        group_count: usize,
    },
    Failed {
        orchestration_id: String,
        phase: Phase,
        error: String,
    },
    VerificationFailed {
        orchestration_id: String,
        issues: Vec<String>,
    },
    Removed {
        orchestration_id: String,
    },
    Worker(WorkerEvent),
    SubSession(SubSessionEvent),
}
