//! Orchestration lifecycle manager.
//!
//! [`Orchestrator`] owns every [`Orchestration`] and drives it through its
//! phases:
//! - sends phase prompts into the main session and parses the replies
//! - hands confirmed task groups to the [`WorkerPool`], or creates child
//!   sessions tracked by the [`SubSessionTracker`]
//! - folds worker results back in and runs aggregation/verification
//! - schedules a debounced state write after every mutation
//!
//! Locks are never held across session I/O. Anything that changes while a
//! request is in flight (pause, cancel) is detected by re-checking the
//! status once the I/O returns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use maestro_core::config::{OrchestratorSettings, WorkerSettings};
use maestro_core::protocol::{
    self, AggregationData, AnalysisData, END_MARKER, PhaseData, START_MARKER, TaskListData,
    VerificationData, fallback,
};
use maestro_core::template::{ExecutionMode, PhasePrompt, TemplateError};
use maestro_core::{TemplateRegistry, Variables};

use crate::session::{CreateSession, SessionControl, SessionError};
use crate::subsession::{
    RegisterOptions, SubSessionError, SubSessionEvent, SubSessionRelation, SubSessionStatus,
    SubSessionTracker,
};

use super::events::{EVENT_CHANNEL_CAPACITY, OrchestratorEvent, WorkerEvent};
use super::persistence::{StateStore, StoreError};
use super::pool::{PoolError, WorkerContext, WorkerPool};
use super::scheduler::{compute_parallel_groups, is_partition, prune_groups};
use super::tools::ToolUsage;
use super::types::{
    Orchestration, OrchestrationStatus, OrchestrationSummary, PausedFrom, Phase, Task,
    WorkerOutput, WorkerState, WorkerStatus,
};

/// Errors from the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Orchestration not found: {id}")]
    NotFound { id: String },

    #[error("Cannot {action} orchestration {id} in status {status}")]
    InvalidTransition {
        id: String,
        status: OrchestrationStatus,
        action: &'static str,
    },

    #[error("Unknown task {task_id} in orchestration {id}")]
    UnknownTask { id: String, task_id: String },

    #[error("Orchestration {id} has no main session")]
    NoMainSession { id: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Sub-session error: {0}")]
    SubSession(#[from] SubSessionError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

fn not_found(id: &str) -> OrchestratorError {
    OrchestratorError::NotFound { id: id.to_string() }
}

fn invalid(id: &str, status: OrchestrationStatus, action: &'static str) -> OrchestratorError {
    OrchestratorError::InvalidTransition {
        id: id.to_string(),
        status,
        action,
    }
}

/// Parameters for [`Orchestrator::create`].
#[derive(Debug, Clone)]
pub struct CreateOrchestration {
    pub template_id: String,
    pub working_dir: PathBuf,
    pub user_request: String,
    /// Placeholder overrides applied on top of the template's variables.
    pub variables: Variables,
}

/// Edits applied to the planned task list by [`Orchestrator::confirm`].
#[derive(Debug, Clone, Default)]
pub struct ConfirmOptions {
    /// Task ids to leave out of execution.
    pub skip: Vec<String>,
    /// New priorities by task id (lower runs first within a group).
    pub priorities: HashMap<String, i32>,
}

/// Work left to do once the orchestration table lock is released.
#[derive(Debug)]
enum FollowUp {
    Send {
        session_id: String,
        phase: Phase,
        message: String,
    },
    Confirm,
}

/// Outcome of checking a running orchestration's workers.
enum Reconcile {
    Stale,
    Waiting { changed: bool },
    NextGroup,
    Finished,
}

const fn expects(status: OrchestrationStatus, data: &PhaseData) -> bool {
    matches!(
        (status, data),
        (OrchestrationStatus::Analyzing, PhaseData::Analysis(_))
            | (OrchestrationStatus::Planning, PhaseData::TaskList(_))
            | (OrchestrationStatus::Aggregating, PhaseData::Aggregation(_))
            | (OrchestrationStatus::Verifying, PhaseData::Verification(_))
    )
}

const fn prompt_for(orch: &Orchestration, phase: Phase) -> &PhasePrompt {
    let phases = &orch.template.phases;
    match phase {
        Phase::Analysis => &phases.analysis,
        Phase::TaskPlanning => &phases.task_planning,
        Phase::WorkerExecution => &phases.worker_execution,
        Phase::Aggregation => &phases.aggregation,
        Phase::Verification => &phases.verification,
    }
}

/// Placeholder values available to every phase prompt. Template variables
/// and per-orchestration overrides win over the built-in values.
fn base_variables(orch: &Orchestration, max_workers: usize) -> Variables {
    let mut vars = Variables::new();
    vars.insert("ORCHESTRATION_ID".into(), Value::from(orch.id.as_str()));
    vars.insert(
        "USER_REQUEST".into(),
        Value::from(orch.user_request.as_str()),
    );
    vars.insert(
        "WORKING_DIR".into(),
        Value::from(orch.working_dir.display().to_string()),
    );
    vars.insert(
        "MAX_WORKERS".into(),
        Value::from(orch.template.config.max_workers.unwrap_or(max_workers)),
    );
    vars.insert("START_MARKER".into(), Value::from(START_MARKER));
    vars.insert("END_MARKER".into(), Value::from(END_MARKER));
    vars.insert("TASK_COUNT".into(), Value::from(orch.active_tasks().count()));
    if let Some(analysis) = &orch.analysis {
        vars.insert(
            "ANALYSIS_SUMMARY".into(),
            Value::from(analysis.summary.as_str()),
        );
        vars.insert(
            "RECOMMENDED_TASK_COUNT".into(),
            analysis
                .recommended_task_count
                .map_or(Value::Null, Value::from),
        );
        vars.insert("KEY_FILES".into(), Value::from(analysis.key_files.clone()));
        vars.insert(
            "COMPLEXITY".into(),
            serde_json::to_value(analysis.complexity).unwrap_or(Value::Null),
        );
    }
    if let Some(aggregation) = &orch.aggregation {
        vars.insert(
            "AGGREGATION_SUMMARY".into(),
            Value::from(aggregation.summary.as_str()),
        );
        vars.insert(
            "CONFLICTS".into(),
            Value::from(aggregation.conflicts.clone()),
        );
    }
    vars.extend(orch.template.variables.clone());
    vars.extend(orch.variables.clone());
    vars
}

fn phase_prompt(
    orch: &Orchestration,
    phase: Phase,
    max_workers: usize,
    extra: Variables,
) -> Option<FollowUp> {
    let session_id = orch.main_session_id.clone()?;
    let mut vars = base_variables(orch, max_workers);
    vars.extend(extra);
    Some(FollowUp::Send {
        session_id,
        phase,
        message: prompt_for(orch, phase).render(&vars),
    })
}

fn worker_context(
    orch: &Orchestration,
    settings: &WorkerSettings,
    max_workers: usize,
) -> WorkerContext {
    WorkerContext::from_template(
        &orch.id,
        orch.working_dir.clone(),
        &orch.template,
        base_variables(orch, max_workers),
        settings,
    )
}

fn session_title(orch: &Orchestration) -> String {
    let request: String = orch.user_request.chars().take(60).collect();
    format!("Maestro: {}", request.trim())
}

/// Tasks of already-dispatched groups that have no worker yet.
fn undispatched(orch: &Orchestration) -> Vec<Task> {
    orch.parallel_groups
        .iter()
        .take(orch.dispatched_groups)
        .flatten()
        .filter(|id| !orch.workers.contains_key(*id))
        .filter_map(|id| orch.task(id))
        .filter(|t| !t.skipped)
        .cloned()
        .collect()
}

fn child_output(task_id: &str, title: &str, relation: &SubSessionRelation) -> WorkerOutput {
    let status = match relation.status {
        SubSessionStatus::Returned => WorkerStatus::Completed,
        SubSessionStatus::Orphaned | SubSessionStatus::Error => WorkerStatus::Failed,
        SubSessionStatus::Active | SubSessionStatus::Completing | SubSessionStatus::Completed => {
            WorkerStatus::Running
        }
    };
    WorkerOutput {
        task_id: task_id.to_string(),
        title: title.to_string(),
        session_id: relation.child_session_id.clone(),
        status,
        output: relation.output.clone(),
        output_files: Vec::new(),
        error: relation.error.clone(),
    }
}

/// Render worker outputs for the `{WORKER_RESULTS}` placeholder.
pub fn format_results(outputs: &[WorkerOutput]) -> String {
    let mut text = String::new();
    for output in outputs {
        let _ = writeln!(
            text,
            "### {} ({}) [{}]",
            output.title, output.task_id, output.status
        );
        let body = output
            .output
            .as_deref()
            .map(str::trim)
            .filter(|out| !out.is_empty());
        if let Some(out) = body {
            let _ = writeln!(text, "{out}");
        }
        if let Some(err) = &output.error {
            let _ = writeln!(text, "Error: {err}");
        } else if body.is_none() {
            text.push_str("(no output)\n");
        }
        if !output.output_files.is_empty() {
            let _ = writeln!(text, "Files: {}", output.output_files.join(", "));
        }
        text.push('\n');
    }
    text.trim_end().to_string()
}

/// Drives orchestrations through analysis, planning, execution,
/// aggregation and verification.
pub struct Orchestrator {
    sessions: Arc<dyn SessionControl>,
    templates: Arc<RwLock<TemplateRegistry>>,
    pool: Arc<WorkerPool>,
    tracker: Arc<SubSessionTracker>,
    store: StateStore,
    settings: OrchestratorSettings,
    orchestrations: RwLock<HashMap<String, Orchestration>>,
    /// Orchestrations with a poll currently running.
    in_flight: Mutex<HashSet<String>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<dyn SessionControl>,
        templates: Arc<RwLock<TemplateRegistry>>,
        pool: Arc<WorkerPool>,
        tracker: Arc<SubSessionTracker>,
        store: StateStore,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions,
            templates,
            pool,
            tracker,
            store,
            settings,
            orchestrations: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Orchestrator events, including forwarded worker and sub-session
    /// events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub const fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub const fn tracker(&self) -> &Arc<SubSessionTracker> {
        &self.tracker
    }

    pub const fn templates(&self) -> &Arc<RwLock<TemplateRegistry>> {
        &self.templates
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status(&self, orch: &Orchestration, from: OrchestrationStatus) {
        if from == orch.status {
            return;
        }
        info!(
            orchestration_id = %orch.id,
            %from,
            to = %orch.status,
            phase = %orch.phase,
            "Orchestration status changed"
        );
        self.emit(OrchestratorEvent::StatusChanged {
            orchestration_id: orch.id.clone(),
            from,
            to: orch.status,
            phase: orch.phase,
        });
    }

    fn advance(&self, orch: &mut Orchestration, phase: Phase) {
        let from = orch.status;
        orch.enter_phase(phase);
        self.emit_status(orch, from);
    }

    fn set_status(&self, orch: &mut Orchestration, status: OrchestrationStatus) {
        let from = orch.status;
        orch.set_status(status);
        self.emit_status(orch, from);
    }

    async fn with_orchestration<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Orchestration) -> Result<T, OrchestratorError>,
    ) -> Result<T, OrchestratorError> {
        let mut map = self.orchestrations.write().await;
        let orch = map.get_mut(id).ok_or_else(|| not_found(id))?;
        f(orch)
    }

    async fn snapshot(&self) -> Vec<Orchestration> {
        let mut all: Vec<Orchestration> =
            self.orchestrations.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    /// Schedule a debounced write of the whole table.
    pub async fn persist(&self) {
        let snapshot = self.snapshot().await;
        self.store.schedule(&snapshot).await;
    }

    /// Write the whole table now.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let snapshot = self.snapshot().await;
        self.store.flush(&snapshot).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Resolve the template and record a new orchestration in `created`.
    pub async fn create(
        &self,
        request: CreateOrchestration,
    ) -> Result<Orchestration, OrchestratorError> {
        let template = self.templates.read().await.resolve(&request.template_id)?;
        let id = format!("orch_{}", Uuid::new_v4().simple());
        let orch = Orchestration::new(
            id.clone(),
            template,
            request.working_dir,
            request.user_request,
            request.variables,
        );
        info!(
            orchestration_id = %id,
            template_id = %orch.template_id,
            working_dir = %orch.working_dir.display(),
            "Orchestration created"
        );
        self.orchestrations
            .write()
            .await
            .insert(id.clone(), orch.clone());
        self.emit(OrchestratorEvent::Created {
            orchestration_id: id,
        });
        self.persist().await;
        Ok(orch)
    }

    pub async fn create_and_start(
        &self,
        request: CreateOrchestration,
    ) -> Result<Orchestration, OrchestratorError> {
        let orch = self.create(request).await?;
        self.start(&orch.id).await
    }

    /// Create the main session with the first phase prompt. A paused
    /// orchestration is resumed instead.
    pub async fn start(&self, id: &str) -> Result<Orchestration, OrchestratorError> {
        let max_workers = self.pool.max_workers();
        let launch = self
            .with_orchestration(id, |orch| {
                match orch.status {
                    OrchestrationStatus::Paused => return Ok(None),
                    OrchestrationStatus::Created => {}
                    status => return Err(invalid(id, status, "start")),
                }
                let phase = if orch.template.phases.analysis.is_active() {
                    Phase::Analysis
                } else {
                    Phase::TaskPlanning
                };
                let message = prompt_for(orch, phase).render(&base_variables(orch, max_workers));
                orch.started_at = Some(Utc::now());
                self.advance(orch, phase);
                Ok(Some((
                    phase,
                    message,
                    orch.working_dir.clone(),
                    session_title(orch),
                )))
            })
            .await?;
        let Some((phase, message, working_dir, title)) = launch else {
            return self.resume(id).await;
        };
        self.persist().await;

        let created = self
            .sessions
            .create_session(CreateSession {
                session_id: Some(format!("main_{id}")),
                working_dir,
                message,
                title: Some(title),
            })
            .await;
        match created {
            Ok(session_id) => {
                info!(orchestration_id = id, %session_id, %phase, "Main session created");
                let orch = self
                    .with_orchestration(id, |orch| {
                        orch.main_session_id = Some(session_id);
                        orch.touch();
                        Ok(orch.clone())
                    })
                    .await?;
                self.persist().await;
                Ok(orch)
            }
            Err(e) => {
                self.fail(id, phase, &format!("failed to create main session: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Apply skip/priority edits to the planned tasks and start execution.
    pub async fn confirm(
        &self,
        id: &str,
        options: ConfirmOptions,
    ) -> Result<Orchestration, OrchestratorError> {
        let mode = self
            .with_orchestration(id, |orch| {
                if orch.status != OrchestrationStatus::Confirming {
                    return Err(invalid(id, orch.status, "confirm"));
                }
                if let Some(unknown) = options
                    .skip
                    .iter()
                    .chain(options.priorities.keys())
                    .find(|task_id| orch.task(task_id).is_none())
                {
                    return Err(OrchestratorError::UnknownTask {
                        id: id.to_string(),
                        task_id: unknown.clone(),
                    });
                }
                for task in &mut orch.tasks {
                    task.skipped = options.skip.contains(&task.id);
                    if let Some(priority) = options.priorities.get(&task.id) {
                        task.priority = Some(*priority);
                    }
                }
                orch.parallel_groups = prune_groups(
                    &orch.parallel_groups,
                    &orch.tasks,
                    !options.priorities.is_empty(),
                );
                orch.dispatched_groups = 0;
                info!(
                    orchestration_id = id,
                    tasks = orch.active_tasks().count(),
                    skipped = options.skip.len(),
                    groups = orch.parallel_groups.len(),
                    "Task list confirmed"
                );
                self.set_status(orch, OrchestrationStatus::Spawning);
                Ok(orch.template.config.execution_mode)
            })
            .await?;
        self.persist().await;

        match mode {
            ExecutionMode::Workers => {
                self.dispatch_next_group(id).await?;
            }
            ExecutionMode::Subsessions => self.spawn_children(id).await?,
        }

        let orch = self
            .with_orchestration(id, |orch| {
                if orch.status == OrchestrationStatus::Spawning {
                    self.advance(orch, Phase::WorkerExecution);
                }
                Ok(orch.clone())
            })
            .await?;
        self.persist().await;
        Ok(orch)
    }

    /// Hand the next parallel group to the pool. Returns false when every
    /// group has been dispatched.
    async fn dispatch_next_group(&self, id: &str) -> Result<bool, OrchestratorError> {
        let settings = self.pool.settings().clone();
        let max_workers = self.pool.max_workers();
        let batch = self
            .with_orchestration(id, |orch| {
                let Some(group) = orch.parallel_groups.get(orch.dispatched_groups) else {
                    return Ok(None);
                };
                let tasks: Vec<Task> = group
                    .iter()
                    .filter_map(|task_id| orch.task(task_id))
                    .filter(|t| !t.skipped)
                    .cloned()
                    .collect();
                let index = orch.dispatched_groups;
                orch.dispatched_groups += 1;
                orch.touch();
                Ok(Some((index, worker_context(orch, &settings, max_workers), tasks)))
            })
            .await?;
        let Some((index, ctx, tasks)) = batch else {
            return Ok(false);
        };

        info!(
            orchestration_id = id,
            group = index + 1,
            tasks = tasks.len(),
            "Dispatching task group"
        );
        let assigned = self.pool.spawn_batch(&ctx, tasks).await?;
        self.with_orchestration(id, |orch| {
            orch.workers.extend(assigned);
            orch.touch();
            Ok(())
        })
        .await?;
        self.persist().await;
        Ok(true)
    }

    /// Protocol-free mode: one child session per task, tracked under the
    /// main session.
    async fn spawn_children(&self, id: &str) -> Result<(), OrchestratorError> {
        let settings = self.pool.settings().clone();
        let max_workers = self.pool.max_workers();
        let (main, ctx, tasks) = self
            .with_orchestration(id, |orch| {
                let main = orch
                    .main_session_id
                    .clone()
                    .ok_or_else(|| OrchestratorError::NoMainSession { id: id.to_string() })?;
                orch.dispatched_groups = orch.parallel_groups.len();
                let tasks: Vec<Task> = orch.active_tasks().cloned().collect();
                Ok((main, worker_context(orch, &settings, max_workers), tasks))
            })
            .await?;

        for task in tasks {
            let child_id = format!("sub_{id}_{}", task.id);
            let message =
                ctx.render_prompt(&WorkerState::queued(child_id.clone(), id, task.clone(), 0));
            let created = self
                .sessions
                .create_session(CreateSession {
                    session_id: Some(child_id),
                    working_dir: ctx.working_dir.clone(),
                    message,
                    title: Some(task.title.clone()),
                })
                .await;
            match created {
                Ok(child) => {
                    match self
                        .tracker
                        .register_sub_session(&child, &main, RegisterOptions::default())
                        .await
                    {
                        Ok(_) | Err(SubSessionError::AlreadyRegistered { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.with_orchestration(id, |orch| {
                        orch.workers.insert(task.id.clone(), child);
                        orch.touch();
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => {
                    warn!(orchestration_id = id, task_id = %task.id, error = %e, "Failed to create sub-session");
                    self.with_orchestration(id, |orch| {
                        orch.log_error(
                            Phase::WorkerExecution,
                            format!("failed to create sub-session for task '{}': {e}", task.id),
                        );
                        Ok(())
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<Orchestration, OrchestratorError> {
        let orch = self
            .with_orchestration(id, |orch| {
                if !orch.status.is_pausable() {
                    return Err(invalid(id, orch.status, "pause"));
                }
                orch.paused_from = Some(PausedFrom {
                    status: orch.status,
                    phase: orch.phase,
                });
                self.set_status(orch, OrchestrationStatus::Paused);
                Ok(orch.clone())
            })
            .await?;
        self.pool.pause_orchestration(id).await;
        self.persist().await;
        Ok(orch)
    }

    /// Return to the exact status and phase held before `pause`.
    pub async fn resume(&self, id: &str) -> Result<Orchestration, OrchestratorError> {
        let orch = self
            .with_orchestration(id, |orch| {
                if orch.status != OrchestrationStatus::Paused {
                    return Err(invalid(id, orch.status, "resume"));
                }
                let from = orch.paused_from.take().unwrap_or(PausedFrom {
                    status: orch.phase.status(),
                    phase: orch.phase,
                });
                let previous = orch.status;
                // Spawning finishes while paused; resume straight into execution.
                if from.status == OrchestrationStatus::Spawning {
                    orch.phase = Phase::WorkerExecution;
                    orch.status = OrchestrationStatus::Running;
                } else {
                    orch.phase = from.phase;
                    orch.status = from.status;
                }
                orch.touch();
                self.emit_status(orch, previous);
                Ok(orch.clone())
            })
            .await?;
        self.pool.resume_orchestration(id).await;
        self.persist().await;
        Ok(orch)
    }

    pub async fn cancel(&self, id: &str) -> Result<Orchestration, OrchestratorError> {
        let orch = self
            .with_orchestration(id, |orch| {
                if orch.status.is_terminal() {
                    return Err(invalid(id, orch.status, "cancel"));
                }
                orch.paused_from = None;
                self.set_status(orch, OrchestrationStatus::Cancelled);
                Ok(orch.clone())
            })
            .await?;
        self.stop_execution(&orch).await;
        self.persist().await;
        Ok(orch)
    }

    async fn stop_execution(&self, orch: &Orchestration) {
        match orch.template.config.execution_mode {
            ExecutionMode::Workers => {
                let cancelled = self.pool.cancel_orchestration(&orch.id).await;
                if cancelled > 0 {
                    debug!(orchestration_id = %orch.id, cancelled, "Cancelled workers");
                }
            }
            ExecutionMode::Subsessions => {
                for child in orch.workers.values() {
                    self.tracker.unregister(child).await;
                }
            }
        }
    }

    /// Move to `error`, log the failure and stop any running work. Terminal
    /// orchestrations are left alone.
    pub async fn fail(&self, id: &str, phase: Phase, error: &str) {
        let failed = {
            let mut map = self.orchestrations.write().await;
            let Some(orch) = map.get_mut(id) else {
                return;
            };
            if orch.status.is_terminal() {
                return;
            }
            orch.log_error(phase, error);
            orch.paused_from = None;
            self.set_status(orch, OrchestrationStatus::Error);
            orch.clone()
        };
        error!(orchestration_id = id, %phase, error, "Orchestration failed");
        self.emit(OrchestratorEvent::Failed {
            orchestration_id: id.to_string(),
            phase,
            error: error.to_string(),
        });
        self.stop_execution(&failed).await;
        self.persist().await;
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    /// Process whatever is new for one orchestration: main-session replies
    /// in the reply-driven phases, worker/child state while running.
    ///
    /// Returns whether anything changed. A poll already in progress for the
    /// same orchestration makes this a no-op.
    pub async fn poll_orchestrator(&self, id: &str) -> Result<bool, OrchestratorError> {
        if !self.in_flight.lock().await.insert(id.to_string()) {
            return Ok(false);
        }
        let result = self.poll_inner(id).await;
        self.in_flight.lock().await.remove(id);
        result
    }

    async fn poll_inner(&self, id: &str) -> Result<bool, OrchestratorError> {
        let (status, phase, session_id, watermark) = {
            let map = self.orchestrations.read().await;
            let orch = map.get(id).ok_or_else(|| not_found(id))?;
            (
                orch.status,
                orch.phase,
                orch.main_session_id.clone(),
                orch.transcript_watermark,
            )
        };
        if status == OrchestrationStatus::Running {
            return self.reconcile(id).await;
        }
        if !status.is_monitored() {
            return Ok(false);
        }
        let Some(session_id) = session_id else {
            return Ok(false);
        };

        let messages = match self.sessions.fetch_transcript(&session_id).await {
            Ok(messages) => messages,
            Err(SessionError::NotFound { .. }) => {
                self.fail(id, phase, "main session no longer exists").await;
                return Ok(true);
            }
            Err(e) => {
                warn!(orchestration_id = id, error = %e, "Failed to fetch main session transcript");
                return Ok(false);
            }
        };
        if messages.len() <= watermark {
            return Ok(false);
        }

        let max_workers = self.pool.max_workers();
        let follow_up = self
            .with_orchestration(id, |orch| {
                if orch.status != status || orch.transcript_watermark != watermark {
                    debug!(orchestration_id = id, "Orchestration changed during poll; dropping transcript");
                    return Ok(None);
                }
                let mut handled = None;
                let mut next_watermark = messages.len();
                for (index, message) in messages.iter().enumerate().skip(watermark) {
                    if !message.is_assistant() {
                        continue;
                    }
                    if let Some(data) = self.take_envelope(orch, &message.content.plain_text()) {
                        handled = Some(data);
                        // Later replies are read on the next poll, in the next phase.
                        next_watermark = index + 1;
                        break;
                    }
                }
                orch.transcript_watermark = next_watermark;
                orch.touch();
                Ok(Some(
                    handled.and_then(|data| self.handle_envelope(orch, data, max_workers)),
                ))
            })
            .await?;
        let Some(follow_up) = follow_up else {
            return Ok(false);
        };
        self.persist().await;
        if let Some(follow_up) = follow_up {
            self.execute(id, follow_up).await;
        }
        Ok(true)
    }

    /// First usable envelope in `text` for the orchestration's current
    /// phase. Validation problems are recorded in the error log.
    fn take_envelope(&self, orch: &mut Orchestration, text: &str) -> Option<PhaseData> {
        let envelopes = protocol::parse_multiple(text);
        if envelopes.is_empty() {
            if let Some(hint) = fallback::detect(text) {
                debug!(
                    orchestration_id = %orch.id,
                    hint = ?hint.phase,
                    confidence = hint.confidence,
                    "Reply has no envelope but resembles a phase response"
                );
            }
            return None;
        }
        for parsed in envelopes {
            let Some(data) = parsed.data else {
                warn!(
                    orchestration_id = %orch.id,
                    error = parsed.error.as_deref().unwrap_or("unknown"),
                    "Undecodable response envelope"
                );
                continue;
            };
            if !expects(orch.status, &data) {
                debug!(
                    orchestration_id = %orch.id,
                    phase = data.phase_name(),
                    status = %orch.status,
                    "Ignoring envelope for another phase"
                );
                continue;
            }
            if !parsed.violations.is_empty() {
                warn!(
                    orchestration_id = %orch.id,
                    phase = data.phase_name(),
                    violations = parsed.violations.len(),
                    "Response envelope failed validation"
                );
                let phase = orch.phase;
                for violation in &parsed.violations {
                    orch.log_error(phase, format!("{} response: {violation}", data.phase_name()));
                }
            }
            return Some(data);
        }
        None
    }

    fn handle_envelope(
        &self,
        orch: &mut Orchestration,
        data: PhaseData,
        max_workers: usize,
    ) -> Option<FollowUp> {
        match data {
            PhaseData::Analysis(analysis) => self.on_analysis(orch, analysis, max_workers),
            PhaseData::TaskList(list) => self.on_task_list(orch, list),
            PhaseData::Aggregation(aggregation) => {
                self.on_aggregation(orch, aggregation, max_workers)
            }
            PhaseData::Verification(verification) => {
                self.on_verification(orch, verification);
                None
            }
            PhaseData::Progress(_) | PhaseData::Completion(_) => None,
        }
    }

    fn on_analysis(
        &self,
        orch: &mut Orchestration,
        analysis: AnalysisData,
        max_workers: usize,
    ) -> Option<FollowUp> {
        info!(
            orchestration_id = %orch.id,
            complexity = ?analysis.complexity,
            recommended_tasks = ?analysis.recommended_task_count,
            "Analysis received"
        );
        orch.analysis = Some(analysis);
        self.advance(orch, Phase::TaskPlanning);
        phase_prompt(orch, Phase::TaskPlanning, max_workers, Variables::new())
    }

    fn on_task_list(&self, orch: &mut Orchestration, list: TaskListData) -> Option<FollowUp> {
        let phase = orch.phase;
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(list.tasks.len());
        for spec in list.tasks {
            let task = Task::from(spec);
            if !task.is_complete() {
                orch.log_error(phase, format!("dropped incomplete task '{}'", task.id));
                continue;
            }
            if !seen.insert(task.id.clone()) {
                orch.log_error(phase, format!("dropped duplicate task '{}'", task.id));
                continue;
            }
            tasks.push(task);
        }
        if tasks.is_empty() {
            warn!(orchestration_id = %orch.id, "Task list has no usable tasks; waiting for another");
            orch.log_error(phase, "task list contained no usable tasks");
            return None;
        }

        let groups = match list.parallelizable_groups {
            Some(groups) if is_partition(&groups, &tasks) => groups,
            Some(_) => {
                debug!(orchestration_id = %orch.id, "Declared groups are not a partition; layering by dependencies");
                compute_parallel_groups(&tasks)
            }
            None => compute_parallel_groups(&tasks),
        };
        let (task_count, group_count) = (tasks.len(), groups.len());
        info!(
            orchestration_id = %orch.id,
            tasks = task_count,
            groups = group_count,
            "Task list received"
        );
        orch.tasks = tasks;
        orch.parallel_groups = groups;
        self.set_status(orch, OrchestrationStatus::Confirming);
        self.emit(OrchestratorEvent::TasksReady {
            orchestration_id: orch.id.clone(),
            task_count,
            group_count,
        });
        orch.template.config.auto_confirm.then_some(FollowUp::Confirm)
    }

    fn on_aggregation(
        &self,
        orch: &mut Orchestration,
        aggregation: AggregationData,
        max_workers: usize,
    ) -> Option<FollowUp> {
        info!(
            orchestration_id = %orch.id,
            conflicts = aggregation.conflicts.len(),
            "Aggregation received"
        );
        orch.aggregation = Some(aggregation);
        if orch.template.phases.verification.is_active() {
            self.advance(orch, Phase::Verification);
            phase_prompt(orch, Phase::Verification, max_workers, Variables::new())
        } else {
            self.set_status(orch, OrchestrationStatus::Completed);
            None
        }
    }

    fn on_verification(&self, orch: &mut Orchestration, verification: VerificationData) {
        if verification.passed {
            info!(orchestration_id = %orch.id, "Verification passed");
        } else {
            warn!(
                orchestration_id = %orch.id,
                issues = verification.issues.len(),
                "Verification failed"
            );
            orch.log_error(
                Phase::Verification,
                format!("verification failed: {}", verification.summary),
            );
            self.emit(OrchestratorEvent::VerificationFailed {
                orchestration_id: orch.id.clone(),
                issues: verification.issues.clone(),
            });
        }
        orch.verification = Some(verification);
        self.set_status(orch, OrchestrationStatus::Completed);
    }

    async fn execute(&self, id: &str, follow_up: FollowUp) {
        match follow_up {
            FollowUp::Send {
                session_id,
                phase,
                message,
            } => {
                if let Err(e) = self.sessions.send_message(&session_id, &message).await {
                    self.fail(id, phase, &format!("failed to send {phase} prompt: {e}"))
                        .await;
                }
            }
            FollowUp::Confirm => {
                info!(orchestration_id = id, "Auto-confirming task list");
                if let Err(e) = self.confirm(id, ConfirmOptions::default()).await {
                    warn!(orchestration_id = id, error = %e, "Auto-confirm failed");
                }
            }
        }
    }

    /// Fold worker (or child) state into a running orchestration, moving on
    /// to the next group or to aggregation once everything dispatched is
    /// terminal.
    async fn reconcile(&self, id: &str) -> Result<bool, OrchestratorError> {
        let (mode, children) = {
            let map = self.orchestrations.read().await;
            let orch = map.get(id).ok_or_else(|| not_found(id))?;
            (
                orch.template.config.execution_mode,
                orch.workers.values().cloned().collect::<Vec<_>>(),
            )
        };

        let decision = match mode {
            ExecutionMode::Workers => {
                let workers = self.pool.workers_for(id).await;
                self.with_orchestration(id, |orch| {
                    if orch.status != OrchestrationStatus::Running {
                        return Ok(Reconcile::Stale);
                    }
                    let mut changed = false;
                    let mut stats = ToolUsage::default();
                    for worker in &workers {
                        stats.add(&worker.tools);
                        if orch.workers.get(&worker.task_id) != Some(&worker.session_id) {
                            orch.workers
                                .insert(worker.task_id.clone(), worker.session_id.clone());
                            changed = true;
                        }
                    }
                    if stats != orch.stats {
                        orch.stats = stats;
                        changed = true;
                    }
                    if changed {
                        orch.touch();
                    }
                    let settled = orch
                        .parallel_groups
                        .iter()
                        .take(orch.dispatched_groups)
                        .flatten()
                        .filter(|task_id| orch.task(task_id).is_some_and(|t| !t.skipped))
                        .all(|task_id| {
                            workers
                                .iter()
                                .any(|w| &w.task_id == task_id && w.status.is_terminal())
                        });
                    Ok(if !settled {
                        Reconcile::Waiting { changed }
                    } else if orch.dispatched_groups < orch.parallel_groups.len() {
                        Reconcile::NextGroup
                    } else {
                        Reconcile::Finished
                    })
                })
                .await?
            }
            ExecutionMode::Subsessions => {
                let mut settled = true;
                for child in &children {
                    if self
                        .tracker
                        .get(child)
                        .await
                        .is_some_and(|r| !r.status.is_settled())
                    {
                        settled = false;
                        break;
                    }
                }
                self.with_orchestration(id, |orch| {
                    Ok(if orch.status != OrchestrationStatus::Running {
                        Reconcile::Stale
                    } else if settled {
                        Reconcile::Finished
                    } else {
                        Reconcile::Waiting { changed: false }
                    })
                })
                .await?
            }
        };

        match decision {
            Reconcile::Stale => Ok(false),
            Reconcile::Waiting { changed } => {
                if changed {
                    self.persist().await;
                }
                Ok(changed)
            }
            Reconcile::NextGroup => {
                self.dispatch_next_group(id).await?;
                Ok(true)
            }
            Reconcile::Finished => {
                self.finish_execution(id).await?;
                Ok(true)
            }
        }
    }

    async fn finish_execution(&self, id: &str) -> Result<(), OrchestratorError> {
        let (mode, assignments) = {
            let map = self.orchestrations.read().await;
            let orch = map.get(id).ok_or_else(|| not_found(id))?;
            let assignments: Vec<(String, String, String)> = orch
                .workers
                .iter()
                .map(|(task_id, session_id)| {
                    let title = orch.task(task_id).map(|t| t.title.clone()).unwrap_or_default();
                    (task_id.clone(), title, session_id.clone())
                })
                .collect();
            (orch.template.config.execution_mode, assignments)
        };
        let outputs = match mode {
            ExecutionMode::Workers => self.pool.collect_outputs(id).await,
            ExecutionMode::Subsessions => {
                let mut outputs = Vec::with_capacity(assignments.len());
                for (task_id, title, child) in &assignments {
                    if let Some(relation) = self.tracker.get(child).await {
                        outputs.push(child_output(task_id, title, &relation));
                    }
                }
                outputs
            }
        };
        let failed = outputs
            .iter()
            .filter(|o| o.status != WorkerStatus::Completed)
            .count();
        let mut extra = Variables::new();
        extra.insert("WORKER_RESULTS".into(), Value::from(format_results(&outputs)));
        extra.insert("WORKER_COUNT".into(), Value::from(outputs.len()));
        extra.insert("FAILED_WORKER_COUNT".into(), Value::from(failed));

        let max_workers = self.pool.max_workers();
        let follow_up = self
            .with_orchestration(id, |orch| {
                if orch.status != OrchestrationStatus::Running {
                    return Ok(None);
                }
                info!(
                    orchestration_id = id,
                    workers = outputs.len(),
                    failed,
                    "Worker execution finished"
                );
                let phases = &orch.template.phases;
                if phases.aggregation.is_active() {
                    self.advance(orch, Phase::Aggregation);
                    Ok(phase_prompt(orch, Phase::Aggregation, max_workers, extra))
                } else if phases.verification.is_active() {
                    self.advance(orch, Phase::Verification);
                    Ok(phase_prompt(orch, Phase::Verification, max_workers, extra))
                } else {
                    self.set_status(orch, OrchestrationStatus::Completed);
                    Ok(None)
                }
            })
            .await?;
        self.persist().await;
        if let Some(follow_up) = follow_up {
            self.execute(id, follow_up).await;
        }
        Ok(())
    }

    /// Poll every orchestration that is waiting on session activity.
    /// Returns how many changed.
    pub async fn poll_all(&self) -> usize {
        let ids: Vec<String> = self
            .orchestrations
            .read()
            .await
            .values()
            .filter(|o| o.status.is_monitored())
            .map(|o| o.id.clone())
            .collect();
        let mut changed = 0;
        for id in ids {
            match self.poll_orchestrator(&id).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!(orchestration_id = %id, error = %e, "Orchestration poll failed"),
            }
        }
        changed
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Option<Orchestration> {
        self.orchestrations.read().await.get(id).cloned()
    }

    pub async fn get_summary(&self, id: &str) -> Option<OrchestrationSummary> {
        let orch = self.get(id).await?;
        Some(self.summarize(&orch).await)
    }

    /// Summaries of every orchestration, oldest first.
    pub async fn list(&self) -> Vec<OrchestrationSummary> {
        let all = self.snapshot().await;
        let mut summaries = Vec::with_capacity(all.len());
        for orch in &all {
            summaries.push(self.summarize(orch).await);
        }
        summaries
    }

    #[allow(clippy::cast_precision_loss)]
    async fn summarize(&self, orch: &Orchestration) -> OrchestrationSummary {
        let mut workers_by_status = BTreeMap::new();
        let mut progress_sum = 0.0;
        match orch.template.config.execution_mode {
            ExecutionMode::Workers => {
                for worker in self.pool.workers_for(&orch.id).await {
                    *workers_by_status.entry(worker.status).or_insert(0) += 1;
                    progress_sum += worker.progress;
                }
            }
            ExecutionMode::Subsessions => {
                for (task_id, child) in &orch.workers {
                    if let Some(relation) = self.tracker.get(child).await {
                        let output = child_output(task_id, "", &relation);
                        *workers_by_status.entry(output.status).or_insert(0) += 1;
                        if relation.status.is_settled() {
                            progress_sum += 100.0;
                        }
                    }
                }
            }
        }
        let task_count = orch.active_tasks().count();
        let progress = if orch.status == OrchestrationStatus::Completed {
            100.0
        } else if task_count == 0 {
            0.0
        } else {
            (progress_sum / task_count as f64).min(100.0)
        };
        OrchestrationSummary {
            id: orch.id.clone(),
            template_id: orch.template_id.clone(),
            status: orch.status,
            phase: orch.phase,
            user_request: orch.user_request.clone(),
            task_count,
            skipped_tasks: orch.tasks.len() - task_count,
            workers_by_status,
            progress,
            error_count: orch.error_log.len(),
            created_at: orch.created_at,
            updated_at: orch.updated_at,
        }
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    pub async fn list_workers(&self, id: &str) -> Result<Vec<WorkerState>, OrchestratorError> {
        if !self.orchestrations.read().await.contains_key(id) {
            return Err(not_found(id));
        }
        Ok(self.pool.workers_for(id).await)
    }

    pub async fn get_worker(&self, session_id: &str) -> Option<WorkerState> {
        self.pool.get_worker(session_id).await
    }

    /// Queue a new attempt for a failed or timed-out worker. Returns the new
    /// attempt's session id.
    pub async fn retry_worker(&self, session_id: &str) -> Result<String, OrchestratorError> {
        let worker = self
            .pool
            .get_worker(session_id)
            .await
            .ok_or_else(|| PoolError::NotFound {
                id: session_id.to_string(),
            })?;
        let orch_id = worker.orchestration_id.clone();
        let status = self
            .get(&orch_id)
            .await
            .ok_or_else(|| not_found(&orch_id))?
            .status;
        if status.is_terminal() {
            return Err(invalid(&orch_id, status, "retry a worker of"));
        }
        let new_session = self.pool.retry(session_id).await?;
        self.with_orchestration(&orch_id, |orch| {
            orch.workers.insert(worker.task_id.clone(), new_session.clone());
            orch.touch();
            Ok(())
        })
        .await?;
        self.persist().await;
        Ok(new_session)
    }

    pub async fn cancel_worker(&self, session_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.pool.cancel(session_id).await?)
    }

    pub async fn pause_worker(&self, session_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.pool.pause(session_id).await?)
    }

    pub async fn resume_worker(&self, session_id: &str) -> Result<(), OrchestratorError> {
        Ok(self.pool.resume(session_id).await?)
    }

    // -----------------------------------------------------------------------
    // Sub-sessions
    // -----------------------------------------------------------------------

    pub async fn register_sub_session(
        &self,
        child: &str,
        parent: &str,
        options: RegisterOptions,
    ) -> Result<SubSessionRelation, OrchestratorError> {
        Ok(self
            .tracker
            .register_sub_session(child, parent, options)
            .await?)
    }

    pub async fn force_return(&self, child: &str) -> Result<SubSessionRelation, OrchestratorError> {
        Ok(self.tracker.force_return(child).await?)
    }

    pub async fn unregister_sub_session(&self, child: &str) -> Option<SubSessionRelation> {
        self.tracker.unregister(child).await
    }

    pub async fn children(&self, parent: &str) -> Vec<SubSessionRelation> {
        self.tracker.children(parent).await
    }

    // -----------------------------------------------------------------------
    // Cleanup and recovery
    // -----------------------------------------------------------------------

    /// Remove an orchestration from memory and persisted state, cancelling it
    /// first if it is still live.
    pub async fn cleanup(&self, id: &str, archive_sessions: bool) -> Result<(), OrchestratorError> {
        let status = self.get(id).await.ok_or_else(|| not_found(id))?.status;
        if !status.is_terminal() {
            self.cancel(id).await?;
        }
        let orch = self
            .orchestrations
            .write()
            .await
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        self.pool.remove_orchestration(id).await;
        if orch.template.config.execution_mode == ExecutionMode::Subsessions {
            for child in orch.workers.values() {
                self.tracker.unregister(child).await;
            }
        }
        if archive_sessions {
            for session_id in orch.main_session_id.iter().chain(orch.workers.values()) {
                if let Err(e) = self.sessions.archive_session(session_id).await {
                    debug!(orchestration_id = id, %session_id, error = %e, "Failed to archive session");
                }
            }
        }
        info!(orchestration_id = id, archive_sessions, "Orchestration removed");
        self.emit(OrchestratorEvent::Removed {
            orchestration_id: id.to_string(),
        });
        self.persist().await;
        Ok(())
    }

    /// Load persisted orchestrations. Running ones get their workers
    /// re-adopted (or children re-registered) and any task of an already
    /// dispatched group without a worker is queued again.
    ///
    /// Returns the number of non-terminal orchestrations restored.
    pub async fn restore(&self) -> Result<usize, OrchestratorError> {
        let loaded = self.store.load().await?;
        let settings = self.pool.settings().clone();
        let max_workers = self.pool.max_workers();
        let total = loaded.len();
        let mut live = 0;

        for mut orch in loaded {
            let id = orch.id.clone();
            if self.orchestrations.read().await.contains_key(&id) {
                continue;
            }
            if orch.status.is_terminal() {
                self.orchestrations.write().await.insert(id, orch);
                continue;
            }
            live += 1;

            if orch.status == OrchestrationStatus::Spawning {
                orch.enter_phase(Phase::WorkerExecution);
            }
            let effective = match (&orch.status, &orch.paused_from) {
                (OrchestrationStatus::Paused, Some(from)) => from.status,
                (status, _) => *status,
            };
            let executing = matches!(
                effective,
                OrchestrationStatus::Spawning | OrchestrationStatus::Running
            );
            let paused = orch.status == OrchestrationStatus::Paused;
            let mode = orch.template.config.execution_mode;
            let ctx = worker_context(&orch, &settings, max_workers);
            let assigned: Vec<(Task, String)> = orch
                .workers
                .iter()
                .filter_map(|(task_id, session_id)| {
                    orch.task(task_id).cloned().map(|t| (t, session_id.clone()))
                })
                .collect();
            let missing = undispatched(&orch);
            let main = orch.main_session_id.clone();
            self.orchestrations.write().await.insert(id.clone(), orch);

            if !executing {
                continue;
            }
            match mode {
                ExecutionMode::Workers => {
                    for (task, session_id) in assigned {
                        self.pool.adopt_worker(&ctx, task, &session_id).await;
                    }
                    if paused {
                        self.pool.pause_orchestration(&id).await;
                    }
                    if !missing.is_empty() {
                        info!(orchestration_id = %id, tasks = missing.len(), "Re-queueing undispatched tasks");
                        let assigned = self.pool.spawn_batch(&ctx, missing).await?;
                        self.with_orchestration(&id, |orch| {
                            orch.workers.extend(assigned);
                            Ok(())
                        })
                        .await?;
                    }
                }
                ExecutionMode::Subsessions => {
                    let Some(main) = main else {
                        continue;
                    };
                    for (_, child) in assigned {
                        match self
                            .tracker
                            .register_sub_session(&child, &main, RegisterOptions::default())
                            .await
                        {
                            Ok(_) | Err(SubSessionError::AlreadyRegistered { .. }) => {}
                            Err(e) => {
                                warn!(orchestration_id = %id, child_session_id = %child, error = %e, "Failed to re-register sub-session");
                            }
                        }
                    }
                }
            }
        }

        info!(total, live, path = %self.store.path().display(), "Restored orchestration state");
        if live > 0 {
            self.persist().await;
        }
        Ok(live)
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    async fn on_worker_event(&self, event: WorkerEvent) {
        let terminal = event.is_terminal();
        let orchestration_id = event.orchestration_id.clone();
        self.emit(OrchestratorEvent::Worker(event));
        if terminal && let Err(e) = self.poll_orchestrator(&orchestration_id).await {
            debug!(%orchestration_id, error = %e, "Reconcile after worker event failed");
        }
    }

    async fn on_sub_session_event(&self, event: SubSessionEvent) {
        let settled_parent = match &event {
            SubSessionEvent::StatusChanged {
                parent_session_id,
                to,
                ..
            } if to.is_settled() => Some(parent_session_id.clone()),
            _ => None,
        };
        self.emit(OrchestratorEvent::SubSession(event));
        let Some(parent) = settled_parent else {
            return;
        };
        let ids: Vec<String> = self
            .orchestrations
            .read()
            .await
            .values()
            .filter(|o| {
                o.status == OrchestrationStatus::Running
                    && o.main_session_id.as_deref() == Some(parent.as_str())
            })
            .map(|o| o.id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.poll_orchestrator(&id).await {
                debug!(orchestration_id = %id, error = %e, "Reconcile after sub-session event failed");
            }
        }
    }

    /// Polling loop. Also forwards worker and sub-session events, and
    /// reconciles an orchestration as soon as one of its workers or children
    /// settles. State is flushed on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.settings.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await; // Skip first immediate tick

        let mut worker_events = self.pool.subscribe();
        let mut sub_session_events = self.tracker.subscribe();

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll_all().await;
                }
                event = worker_events.recv() => match event {
                    Ok(event) => self.on_worker_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Worker event stream lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
                event = sub_session_events.recv() => match event {
                    Ok(event) => self.on_sub_session_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sub-session event stream lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
                _ = shutdown.changed() => {
                    info!("Orchestrator loop shutting down");
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "Failed to flush orchestration state");
                    }
                    return;
                }
            }
        }
    }
}
