//! Orchestration and worker state records.
//!
//! Everything here is plain data: the state machine in
//! [`manager`](super::manager) and the pool in [`pool`](super::pool) are the
//! only writers. All records serialize to camelCase JSON with ISO-8601
//! timestamps, which is also the on-disk format.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use maestro_core::Template;
use maestro_core::Variables;
use maestro_core::protocol::{AggregationData, AnalysisData, TaskSpec, VerificationData};

use super::tools::ToolUsage;

/// Lifecycle status of an orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Created,
    Analyzing,
    Planning,
    Confirming,
    Spawning,
    Running,
    Aggregating,
    Verifying,
    Completed,
    Paused,
    Cancelled,
    Error,
}

impl OrchestrationStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    /// Statuses from which `pause` is accepted.
    pub const fn is_pausable(self) -> bool {
        matches!(
            self,
            Self::Analyzing
                | Self::Planning
                | Self::Confirming
                | Self::Spawning
                | Self::Running
                | Self::Aggregating
                | Self::Verifying
        )
    }

    /// Statuses in which the main session transcript is watched.
    pub const fn is_monitored(self) -> bool {
        matches!(
            self,
            Self::Analyzing | Self::Planning | Self::Running | Self::Aggregating | Self::Verifying
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Analyzing => "analyzing",
            Self::Planning => "planning",
            Self::Confirming => "confirming",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Aggregating => "aggregating",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Analysis,
    TaskPlanning,
    WorkerExecution,
    Aggregation,
    Verification,
}

impl Phase {
    /// The working status a phase maps onto.
    pub const fn status(self) -> OrchestrationStatus {
        match self {
            Self::Analysis => OrchestrationStatus::Analyzing,
            Self::TaskPlanning => OrchestrationStatus::Planning,
            Self::WorkerExecution => OrchestrationStatus::Running,
            Self::Aggregation => OrchestrationStatus::Aggregating,
            Self::Verification => OrchestrationStatus::Verifying,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::TaskPlanning => "taskPlanning",
            Self::WorkerExecution => "workerExecution",
            Self::Aggregation => "aggregation",
            Self::Verification => "verification",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work produced by task planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
    /// Excluded at confirmation.
    #[serde(default)]
    pub skipped: bool,
}

impl Task {
    /// Whether the task has the fields a worker needs.
    pub fn is_complete(&self) -> bool {
        !self.id.trim().is_empty()
            && !self.title.trim().is_empty()
            && !self.description.trim().is_empty()
    }
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            title: spec.title,
            description: spec.description,
            scope: spec.scope,
            priority: spec.priority,
            dependencies: spec.dependencies,
            estimated_tokens: spec.estimated_tokens,
            skipped: false,
        }
    }
}

/// One entry in an orchestration's append-only error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub phase: Phase,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Status and phase captured when an orchestration is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedFrom {
    pub status: OrchestrationStatus,
    pub phase: Phase,
}

/// Full state of one orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orchestration {
    pub id: String,
    pub template_id: String,
    /// Template with inheritance already flattened.
    pub template: Template,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_session_id: Option<String>,
    pub working_dir: PathBuf,
    pub user_request: String,
    pub status: OrchestrationStatus,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisData>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub parallel_groups: Vec<Vec<String>>,
    /// Number of `parallel_groups` handed to execution so far.
    #[serde(default)]
    pub dispatched_groups: usize,
    /// Task id to the session id of its current worker (or child session).
    #[serde(default)]
    pub workers: BTreeMap<String, String>,
    #[serde(default)]
    pub stats: ToolUsage,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<PausedFrom>,
    /// Main-session messages already consumed.
    #[serde(default)]
    pub transcript_watermark: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_log: Vec<ErrorEntry>,
}

impl Orchestration {
    pub fn new(
        id: String,
        template: Template,
        working_dir: PathBuf,
        user_request: String,
        variables: Variables,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            template_id: template.id.clone(),
            template,
            main_session_id: None,
            working_dir,
            user_request,
            status: OrchestrationStatus::Created,
            phase: Phase::Analysis,
            analysis: None,
            tasks: Vec::new(),
            parallel_groups: Vec::new(),
            dispatched_groups: 0,
            workers: BTreeMap::new(),
            stats: ToolUsage::default(),
            variables,
            aggregation: None,
            verification: None,
            paused_from: None,
            transcript_watermark: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_log: Vec::new(),
        }
    }

    /// Move to `phase` and its mapped status.
    pub fn enter_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.status = phase.status();
        self.touch();
    }

    pub fn set_status(&mut self, status: OrchestrationStatus) {
        self.status = status;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn log_error(&mut self, phase: Phase, error: impl Into<String>) {
        self.error_log.push(ErrorEntry {
            phase,
            error: error.into(),
            timestamp: Utc::now(),
        });
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Tasks that were not skipped at confirmation.
    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| !t.skipped)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Waiting for a free slot.
    Queued,
    Spawning,
    Running,
    Paused,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl WorkerStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether a worker in this status occupies a pool slot.
    pub const fn holds_slot(self) -> bool {
        matches!(self, Self::Spawning | Self::Running | Self::Paused)
    }

    /// Terminal and eligible for retry.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one worker attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerState {
    pub session_id: String,
    pub orchestration_id: String,
    pub task_id: String,
    pub task: Task,
    pub status: WorkerStatus,
    /// 0-100; held at 99 or below until a completion envelope arrives.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
    #[serde(default)]
    pub tools: ToolUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkerState {
    pub fn queued(session_id: String, orchestration_id: &str, task: Task, retry_count: u32) -> Self {
        Self {
            session_id,
            orchestration_id: orchestration_id.to_string(),
            task_id: task.id.clone(),
            task,
            status: WorkerStatus::Queued,
            progress: 0.0,
            current_action: None,
            tools: ToolUsage::default(),
            output: None,
            output_files: Vec::new(),
            error: None,
            retry_count,
            queued_at: Utc::now(),
            started_at: None,
            last_poll_at: None,
            completed_at: None,
        }
    }

    /// Move to a terminal status, stamping the completion time.
    pub fn finish(&mut self, status: WorkerStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        if status == WorkerStatus::Completed {
            self.progress = 100.0;
        }
    }
}

/// Deterministic worker session id. Attempt 0 carries no suffix so a
/// re-dispatch of the same task after a restart lands on the same session.
pub fn worker_session_id(orchestration_id: &str, task_id: &str, attempt: u32) -> String {
    if attempt == 0 {
        format!("worker_{orchestration_id}_{task_id}")
    } else {
        format!("worker_{orchestration_id}_{task_id}_r{attempt}")
    }
}

/// Attempt number encoded in a worker session id (0 when absent).
pub fn attempt_from_session_id(session_id: &str) -> u32 {
    session_id
        .rsplit_once("_r")
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

/// Output record for one task, regardless of how its worker ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub task_id: String,
    pub title: String,
    pub session_id: String,
    pub status: WorkerStatus,
    pub output: Option<String>,
    pub output_files: Vec<String>,
    pub error: Option<String>,
}

/// Compact status view returned by `get_summary` and `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSummary {
    pub id: String,
    pub template_id: String,
    pub status: OrchestrationStatus,
    pub phase: Phase,
    pub user_request: String,
    pub task_count: usize,
    pub skipped_tasks: usize,
    pub workers_by_status: BTreeMap<WorkerStatus, usize>,
    /// Mean progress over active tasks, 0-100.
    pub progress: f64,
    pub error_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
