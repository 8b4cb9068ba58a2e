//! Worker pool: admission, queueing, polling and retry of worker sessions.
//!
//! Every worker is one session created through [`SessionControl`]. The pool
//! admits a task when both the global cap and its orchestration's cap have a
//! free slot, otherwise the task waits in a FIFO queue that is drained after
//! every polling sweep.
//!
//! All bookkeeping lives in one state struct behind a single mutex, so
//! admission decisions are a single critical section. The lock is never held
//! across session I/O; after I/O returns, the worker's status is re-checked
//! and stale results are dropped.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use maestro_core::Variables;
use maestro_core::config::WorkerSettings;
use maestro_core::protocol::{self, CompletionData, PhaseData, fallback};
use maestro_core::template::{PhasePrompt, Template};

use crate::session::{CreateSession, SessionControl, SessionError};

use super::events::{EVENT_CHANNEL_CAPACITY, WorkerEvent, WorkerEventKind};
use super::tools::ToolUsage;
use super::types::{
    Task, WorkerOutput, WorkerState, WorkerStatus, attempt_from_session_id, worker_session_id,
};

/// Fallback when a pool is configured with a zero cap.
const DEFAULT_MAX_WORKERS: usize = 3;

/// Everything the pool needs to spawn workers for one orchestration.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub orchestration_id: String,
    pub working_dir: PathBuf,
    /// Worker-execution prompt pair.
    pub prompt: PhasePrompt,
    /// Orchestration-level placeholder values; task fields are added per worker.
    pub variables: Variables,
    pub max_workers: usize,
    pub worker_timeout: Duration,
    pub retry_on_error: bool,
    pub retry_limit: u32,
}

impl WorkerContext {
    /// Build a context from a resolved template, falling back to daemon
    /// settings for anything the template leaves unset.
    pub fn from_template(
        orchestration_id: &str,
        working_dir: PathBuf,
        template: &Template,
        variables: Variables,
        settings: &WorkerSettings,
    ) -> Self {
        let config = &template.config;
        Self {
            orchestration_id: orchestration_id.to_string(),
            working_dir,
            prompt: template.phases.worker_execution.clone(),
            variables,
            max_workers: config.max_workers.unwrap_or(settings.max_workers),
            worker_timeout: config
                .worker_timeout_ms
                .map_or_else(|| settings.worker_timeout(), Duration::from_millis),
            retry_on_error: config.retry_on_error,
            retry_limit: config.retry_limit.unwrap_or(settings.retry_limit),
        }
    }

    pub(crate) fn render_prompt(&self, worker: &WorkerState) -> String {
        let task = &worker.task;
        let mut vars = self.variables.clone();
        vars.insert("TASK_ID".into(), Value::String(task.id.clone()));
        vars.insert("TASK_TITLE".into(), Value::String(task.title.clone()));
        vars.insert(
            "TASK_DESCRIPTION".into(),
            Value::String(task.description.clone()),
        );
        let scope = if task.scope.is_empty() {
            Value::String("(unrestricted)".into())
        } else {
            Value::from(task.scope.clone())
        };
        vars.insert("TASK_SCOPE".into(), scope);
        vars.insert(
            "TASK_DEPENDENCIES".into(),
            Value::from(task.dependencies.clone()),
        );
        vars.insert(
            "TASK_PRIORITY".into(),
            task.priority.map_or(Value::Null, Value::from),
        );
        vars.insert(
            "WORKER_SESSION_ID".into(),
            Value::String(worker.session_id.clone()),
        );
        self.prompt.render(&vars)
    }
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool is full ({max} active)")]
    PoolFull { max: usize },

    #[error("Worker not found: {id}")]
    NotFound { id: String },

    #[error("No worker context for orchestration: {id}")]
    UnknownOrchestration { id: String },

    #[error("Cannot {action} worker {id} in status {status}")]
    InvalidState {
        id: String,
        status: WorkerStatus,
        action: &'static str,
    },

    #[error("Retry limit reached for worker {id} ({limit} retries)")]
    RetryLimit { id: String, limit: u32 },

    #[error("Worker prompt for task {task_id} is empty")]
    EmptyPrompt { task_id: String },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Aggregate view over a set of workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub by_status: BTreeMap<WorkerStatus, usize>,
    pub tools: ToolUsage,
    /// Workers holding a slot.
    pub active: usize,
    pub queued: usize,
    pub max_workers: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Every attempt, keyed by session id.
    workers: HashMap<String, WorkerState>,
    /// `(orchestration_id, task_id)` to the session id of the current attempt.
    current: HashMap<(String, String), String>,
    contexts: HashMap<String, WorkerContext>,
    queue: VecDeque<String>,
    paused: HashSet<String>,
    /// Transcript messages already consumed, per session.
    watermarks: HashMap<String, usize>,
    in_flight: HashSet<String>,
}

impl PoolState {
    fn active_total(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status.holds_slot())
            .count()
    }

    fn active_for(&self, orchestration_id: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.orchestration_id == orchestration_id && w.status.holds_slot())
            .count()
    }

    fn has_slot(&self, global_max: usize, ctx: &WorkerContext) -> bool {
        self.active_total() < global_max
            && self.active_for(&ctx.orchestration_id) < ctx.max_workers.max(1)
    }

    fn current_worker(&self, orchestration_id: &str, task_id: &str) -> Option<&WorkerState> {
        self.current
            .get(&(orchestration_id.to_string(), task_id.to_string()))
            .and_then(|id| self.workers.get(id))
    }

    /// First unused session id for a task, starting at `attempt`.
    fn free_session_id(&self, orchestration_id: &str, task_id: &str, mut attempt: u32) -> String {
        loop {
            let id = worker_session_id(orchestration_id, task_id, attempt);
            if !self.workers.contains_key(&id) {
                return id;
            }
            attempt += 1;
        }
    }

    fn insert_current(&mut self, worker: WorkerState) {
        self.current.insert(
            (worker.orchestration_id.clone(), worker.task_id.clone()),
            worker.session_id.clone(),
        );
        self.workers.insert(worker.session_id.clone(), worker);
    }

    fn is_current(&self, worker: &WorkerState) -> bool {
        self.current
            .get(&(worker.orchestration_id.clone(), worker.task_id.clone()))
            .is_some_and(|id| *id == worker.session_id)
    }
}

enum Admission {
    Launch(String),
    Queued(String),
    Existing(String),
}

/// Concurrency-capped pool of worker sessions.
pub struct WorkerPool {
    sessions: Arc<dyn SessionControl>,
    settings: WorkerSettings,
    state: Mutex<PoolState>,
    events: broadcast::Sender<WorkerEvent>,
}

impl WorkerPool {
    pub fn new(sessions: Arc<dyn SessionControl>, mut settings: WorkerSettings) -> Self {
        if settings.max_workers == 0 {
            settings.max_workers = DEFAULT_MAX_WORKERS;
        }
        info!(max_workers = settings.max_workers, "WorkerPool created");
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions,
            settings,
            state: Mutex::new(PoolState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub const fn max_workers(&self) -> usize {
        self.settings.max_workers
    }

    pub const fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    fn emit(&self, worker: &WorkerState, kind: WorkerEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(WorkerEvent {
            orchestration_id: worker.orchestration_id.clone(),
            task_id: worker.task_id.clone(),
            session_id: worker.session_id.clone(),
            kind,
        });
    }

    /// Register or replace the spawn context for an orchestration.
    pub async fn register_context(&self, ctx: WorkerContext) {
        self.state
            .lock()
            .await
            .contexts
            .insert(ctx.orchestration_id.clone(), ctx);
    }

    /// Spawn one worker immediately.
    ///
    /// Returns the existing worker if the task already has a live one, and
    /// [`PoolError::PoolFull`] when no slot is free. A session-creation
    /// failure leaves the worker `failed` and is returned as an error.
    pub async fn spawn_worker(
        &self,
        ctx: &WorkerContext,
        task: Task,
    ) -> Result<WorkerState, PoolError> {
        let admission = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state
                .contexts
                .insert(ctx.orchestration_id.clone(), ctx.clone());
            self.admit(state, ctx, task, false)?
        };
        match admission {
            Admission::Launch(id) => self.launch(&id).await,
            Admission::Existing(id) | Admission::Queued(id) => self
                .get_worker(&id)
                .await
                .ok_or(PoolError::NotFound { id }),
        }
    }

    /// Spawn as many `tasks` as admission allows and queue the rest.
    ///
    /// Returns `(task_id, session_id)` for every task, in input order.
    /// Individual spawn failures are recorded on the worker, not returned.
    pub async fn spawn_batch(
        &self,
        ctx: &WorkerContext,
        tasks: Vec<Task>,
    ) -> Result<Vec<(String, String)>, PoolError> {
        let mut assigned = Vec::with_capacity(tasks.len());
        let mut launches = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state
                .contexts
                .insert(ctx.orchestration_id.clone(), ctx.clone());
            for task in tasks {
                let task_id = task.id.clone();
                let id = match self.admit(state, ctx, task, true)? {
                    Admission::Launch(id) => {
                        launches.push(id.clone());
                        id
                    }
                    Admission::Queued(id) | Admission::Existing(id) => id,
                };
                assigned.push((task_id, id));
            }
        }

        info!(
            orchestration_id = %ctx.orchestration_id,
            launching = launches.len(),
            queued = assigned.len() - launches.len(),
            "Spawning worker batch"
        );

        for (i, id) in launches.iter().enumerate() {
            if i > 0 {
                self.spawn_pause().await;
            }
            if let Err(e) = self.launch(id).await {
                warn!(session_id = %id, error = %e, "Worker spawn failed");
            }
        }
        Ok(assigned)
    }

    /// Reserve a slot (or a queue position) for `task`. Caller holds the lock.
    fn admit(
        &self,
        state: &mut PoolState,
        ctx: &WorkerContext,
        task: Task,
        allow_queue: bool,
    ) -> Result<Admission, PoolError> {
        let orch = &ctx.orchestration_id;
        let mut attempt = 0;
        let mut retry_count = 0;
        if let Some(existing) = state.current_worker(orch, &task.id) {
            if !existing.status.is_terminal() {
                return Ok(Admission::Existing(existing.session_id.clone()));
            }
            attempt = attempt_from_session_id(&existing.session_id) + 1;
            retry_count = existing.retry_count;
        }

        let has_slot =
            !state.paused.contains(orch) && state.has_slot(self.settings.max_workers, ctx);
        if !has_slot && !allow_queue {
            return Err(PoolError::PoolFull {
                max: self.settings.max_workers.min(ctx.max_workers.max(1)),
            });
        }

        let id = state.free_session_id(orch, &task.id, attempt);
        let mut worker = WorkerState::queued(id.clone(), orch, task, retry_count);
        if has_slot {
            worker.status = WorkerStatus::Spawning;
            worker.started_at = Some(Utc::now());
            state.insert_current(worker);
            Ok(Admission::Launch(id))
        } else {
            debug!(session_id = %id, "No free slot; worker queued");
            self.emit(&worker, WorkerEventKind::Queued);
            state.insert_current(worker);
            state.queue.push_back(id.clone());
            Ok(Admission::Queued(id))
        }
    }

    /// Create the session for a worker already reserved as `spawning`.
    async fn launch(&self, session_id: &str) -> Result<WorkerState, PoolError> {
        let request = {
            let guard = self.state.lock().await;
            let worker = guard
                .workers
                .get(session_id)
                .ok_or_else(|| PoolError::NotFound {
                    id: session_id.to_string(),
                })?;
            let ctx = guard.contexts.get(&worker.orchestration_id).ok_or_else(|| {
                PoolError::UnknownOrchestration {
                    id: worker.orchestration_id.clone(),
                }
            })?;
            let message = ctx.render_prompt(worker);
            if message.trim().is_empty() {
                let task_id = worker.task_id.clone();
                drop(guard);
                self.fail_spawn(session_id, "worker prompt is empty").await;
                return Err(PoolError::EmptyPrompt { task_id });
            }
            CreateSession {
                session_id: Some(session_id.to_string()),
                working_dir: ctx.working_dir.clone(),
                message,
                title: Some(format!("{}: {}", worker.task_id, worker.task.title)),
            }
        };

        match self.sessions.create_session(request).await {
            Ok(actual_id) => {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let mut id = session_id.to_string();
                if actual_id != session_id
                    && let Some(mut worker) = state.workers.remove(session_id)
                {
                    warn!(
                        requested = %session_id,
                        assigned = %actual_id,
                        "Session backend assigned a different worker id"
                    );
                    worker.session_id.clone_from(&actual_id);
                    let key = (worker.orchestration_id.clone(), worker.task_id.clone());
                    if state.current.get(&key).is_some_and(|c| c == session_id) {
                        state.current.insert(key, actual_id.clone());
                    }
                    state.workers.insert(actual_id.clone(), worker);
                    id = actual_id;
                }
                let outcome = match state.workers.get_mut(&id) {
                    Some(worker) if worker.status == WorkerStatus::Spawning => {
                        worker.status = WorkerStatus::Running;
                        worker.started_at = Some(Utc::now());
                        info!(
                            orchestration_id = %worker.orchestration_id,
                            task_id = %worker.task_id,
                            session_id = %id,
                            "Worker spawned"
                        );
                        let snapshot = worker.clone();
                        self.emit(&snapshot, WorkerEventKind::Spawned);
                        return Ok(snapshot);
                    }
                    Some(worker) => {
                        debug!(session_id = %id, status = %worker.status, "Worker changed state during spawn");
                        Ok(worker.clone())
                    }
                    None => Err(PoolError::NotFound { id: id.clone() }),
                };
                drop(guard);

                // The session outlived its worker; close it so the agent stops.
                if let Err(e) = self.sessions.archive_session(&id).await {
                    warn!(session_id = %id, error = %e, "Failed to archive abandoned worker session");
                }
                outcome
            }
            Err(e) => {
                self.fail_spawn(session_id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn fail_spawn(&self, session_id: &str, reason: &str) {
        let mut guard = self.state.lock().await;
        warn!(session_id, reason, "Worker session could not be created");
        self.finish(
            &mut guard,
            session_id,
            WorkerStatus::Failed,
            Some(format!("spawn failed: {reason}")),
            Utc::now(),
        );
    }

    async fn spawn_pause(&self) {
        let delay = self.settings.spawn_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Move a worker to a terminal status. Caller holds the lock.
    ///
    /// Failures of the current attempt are re-queued automatically when the
    /// orchestration enables `retry_on_error` and retries remain.
    fn finish(
        &self,
        state: &mut PoolState,
        session_id: &str,
        to: WorkerStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) {
        let Some(worker) = state.workers.get_mut(session_id) else {
            return;
        };
        if worker.status.is_terminal() {
            return;
        }
        let from = worker.status;
        worker.finish(to, at);
        if error.is_some() {
            worker.error.clone_from(&error);
        }
        let snapshot = worker.clone();
        state.queue.retain(|id| id != session_id);
        state.in_flight.remove(session_id);

        match to {
            WorkerStatus::Completed => info!(
                orchestration_id = %snapshot.orchestration_id,
                task_id = %snapshot.task_id,
                session_id,
                "Worker completed"
            ),
            _ => warn!(
                orchestration_id = %snapshot.orchestration_id,
                task_id = %snapshot.task_id,
                session_id,
                status = %to,
                error = error.as_deref().unwrap_or(""),
                "Worker ended"
            ),
        }
        self.emit(&snapshot, WorkerEventKind::StatusChanged { from, to, error });

        if to.is_failure() && state.is_current(&snapshot) {
            let auto = state
                .contexts
                .get(&snapshot.orchestration_id)
                .is_some_and(|ctx| ctx.retry_on_error && snapshot.retry_count < ctx.retry_limit);
            if auto {
                self.requeue(state, &snapshot);
            }
        }
    }

    /// Queue a fresh attempt for a failed worker. Caller holds the lock.
    fn requeue(&self, state: &mut PoolState, failed: &WorkerState) -> String {
        let attempt = attempt_from_session_id(&failed.session_id) + 1;
        let id = state.free_session_id(&failed.orchestration_id, &failed.task_id, attempt);
        let fresh = WorkerState::queued(
            id.clone(),
            &failed.orchestration_id,
            failed.task.clone(),
            failed.retry_count + 1,
        );
        info!(
            task_id = %failed.task_id,
            previous = %failed.session_id,
            session_id = %id,
            retry = fresh.retry_count,
            "Retrying worker"
        );
        self.emit(
            &fresh,
            WorkerEventKind::Retrying {
                previous_session_id: failed.session_id.clone(),
                attempt,
            },
        );
        state.insert_current(fresh);
        state.queue.push_back(id.clone());
        id
    }

    /// Poll every running worker once, then drain the queue.
    pub async fn poll_all_workers(&self) -> usize {
        self.poll_all_workers_at(Utc::now()).await
    }

    /// [`poll_all_workers`](Self::poll_all_workers) against an explicit clock.
    ///
    /// Returns the number of transcripts fetched.
    pub async fn poll_all_workers_at(&self, now: DateTime<Utc>) -> usize {
        let targets: Vec<String> = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let expired: Vec<(String, Duration)> = state
                .workers
                .values()
                .filter(|w| matches!(w.status, WorkerStatus::Running | WorkerStatus::Spawning))
                .filter_map(|w| {
                    let timeout = state.contexts.get(&w.orchestration_id)?.worker_timeout;
                    let started = w.started_at?;
                    let elapsed = (now - started).to_std().ok()?;
                    (elapsed >= timeout).then(|| (w.session_id.clone(), timeout))
                })
                .collect();
            for (id, timeout) in expired {
                self.finish(
                    state,
                    &id,
                    WorkerStatus::Timeout,
                    Some(format!("no completion within {}s", timeout.as_secs())),
                    now,
                );
            }

            let targets: Vec<String> = state
                .workers
                .values()
                .filter(|w| w.status == WorkerStatus::Running)
                .map(|w| w.session_id.clone())
                .filter(|id| !state.in_flight.contains(id))
                .collect();
            state.in_flight.extend(targets.iter().cloned());
            targets
        };

        let polled = targets.len();
        for id in targets {
            let fetched = self.sessions.fetch_transcript(&id).await;
            self.apply_transcript(&id, fetched, now).await;
        }
        self.drain_queue().await;
        polled
    }

    async fn apply_transcript(
        &self,
        session_id: &str,
        fetched: Result<Vec<crate::session::TranscriptMessage>, SessionError>,
        now: DateTime<Utc>,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.in_flight.remove(session_id);

        let messages = match fetched {
            Ok(messages) => messages,
            Err(SessionError::NotFound { .. }) => {
                if state
                    .workers
                    .get(session_id)
                    .is_some_and(|w| w.status == WorkerStatus::Running)
                {
                    self.finish(
                        state,
                        session_id,
                        WorkerStatus::Failed,
                        Some("worker session no longer exists".into()),
                        now,
                    );
                }
                return;
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to fetch worker transcript");
                return;
            }
        };

        let Some(worker) = state.workers.get_mut(session_id) else {
            return;
        };
        if worker.status != WorkerStatus::Running {
            debug!(session_id, status = %worker.status, "Discarding stale worker poll");
            return;
        }
        worker.last_poll_at = Some(now);

        let seen = state.watermarks.get(session_id).copied().unwrap_or(0);
        if messages.len() <= seen {
            return;
        }
        state.watermarks.insert(session_id.to_string(), messages.len());

        let before = (worker.progress, worker.current_action.clone(), worker.tools);
        worker.tools = ToolUsage::from_transcript(&messages);

        let mut completion: Option<CompletionData> = None;
        for message in messages[seen..].iter().filter(|m| m.is_assistant()) {
            let text = message.content.plain_text();
            let envelopes = protocol::parse_multiple(&text);
            if envelopes.is_empty() {
                if let Some(hint) = fallback::detect(&text) {
                    debug!(
                        session_id,
                        phase = ?hint.phase,
                        confidence = hint.confidence,
                        "No envelope in worker reply; heuristic hint only"
                    );
                }
                continue;
            }
            for parsed in envelopes {
                match parsed.data {
                    Some(PhaseData::Progress(p)) => {
                        if let Some(value) = p.progress {
                            worker.progress = value.clamp(0.0, 99.0);
                        }
                        if let Some(action) = p.current_action.or(p.message) {
                            worker.current_action = Some(action);
                        }
                    }
                    Some(PhaseData::Completion(c)) => completion = Some(c),
                    Some(other) => {
                        debug!(session_id, phase = other.phase_name(), "Ignoring non-worker envelope");
                    }
                    None => warn!(
                        session_id,
                        error = parsed.error.as_deref().unwrap_or("unknown"),
                        "Invalid envelope in worker reply"
                    ),
                }
            }
        }

        if let Some(done) = completion {
            worker.output = done
                .output
                .or_else(|| (!done.summary.is_empty()).then(|| done.summary.clone()));
            worker.output_files = done.output_files;
            if done.success {
                self.finish(state, session_id, WorkerStatus::Completed, None, now);
            } else {
                let reason = done
                    .error
                    .or_else(|| (!done.summary.is_empty()).then_some(done.summary))
                    .unwrap_or_else(|| "worker reported failure".into());
                self.finish(state, session_id, WorkerStatus::Failed, Some(reason), now);
            }
            return;
        }

        if (worker.progress, worker.current_action.clone(), worker.tools) != before {
            let snapshot = worker.clone();
            self.emit(
                &snapshot,
                WorkerEventKind::Progress {
                    progress: snapshot.progress,
                    current_action: snapshot.current_action.clone(),
                    tools: snapshot.tools,
                },
            );
        }
    }

    /// Launch queued workers into free slots, oldest first.
    ///
    /// Workers of paused orchestrations stay queued. Returns how many were
    /// launched.
    pub async fn drain_queue(&self) -> usize {
        let mut launched = 0;
        loop {
            let next = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                let position = state.queue.iter().position(|id| {
                    state.workers.get(id).is_some_and(|w| {
                        !state.paused.contains(&w.orchestration_id)
                            && state
                                .contexts
                                .get(&w.orchestration_id)
                                .is_some_and(|ctx| state.has_slot(self.settings.max_workers, ctx))
                    })
                });
                position.and_then(|pos| {
                    let id = state.queue.remove(pos)?;
                    let worker = state.workers.get_mut(&id)?;
                    worker.status = WorkerStatus::Spawning;
                    worker.started_at = Some(Utc::now());
                    Some(id)
                })
            };
            let Some(id) = next else { break };
            if launched > 0 {
                self.spawn_pause().await;
            }
            if let Err(e) = self.launch(&id).await {
                warn!(session_id = %id, error = %e, "Queued worker failed to spawn");
            }
            launched += 1;
        }
        launched
    }

    /// `running` -> `paused`. Paused workers keep their slot and are not polled.
    pub async fn pause(&self, session_id: &str) -> Result<(), PoolError> {
        self.transition(session_id, WorkerStatus::Running, WorkerStatus::Paused, "pause")
            .await
    }

    /// `paused` -> `running`.
    pub async fn resume(&self, session_id: &str) -> Result<(), PoolError> {
        self.transition(session_id, WorkerStatus::Paused, WorkerStatus::Running, "resume")
            .await
    }

    async fn transition(
        &self,
        session_id: &str,
        from: WorkerStatus,
        to: WorkerStatus,
        action: &'static str,
    ) -> Result<(), PoolError> {
        let mut guard = self.state.lock().await;
        let worker = guard
            .workers
            .get_mut(session_id)
            .ok_or_else(|| PoolError::NotFound {
                id: session_id.to_string(),
            })?;
        if worker.status != from {
            return Err(PoolError::InvalidState {
                id: session_id.to_string(),
                status: worker.status,
                action,
            });
        }
        worker.status = to;
        let snapshot = worker.clone();
        drop(guard);
        info!(session_id, %from, %to, "Worker {action}d");
        self.emit(
            &snapshot,
            WorkerEventKind::StatusChanged {
                from,
                to,
                error: None,
            },
        );
        Ok(())
    }

    /// Cancel a non-terminal worker. The slot is released by the status
    /// change itself, so it is freed exactly once.
    pub async fn cancel(&self, session_id: &str) -> Result<(), PoolError> {
        let had_session = {
            let mut guard = self.state.lock().await;
            let worker = guard
                .workers
                .get(session_id)
                .ok_or_else(|| PoolError::NotFound {
                    id: session_id.to_string(),
                })?;
            if worker.status.is_terminal() {
                return Err(PoolError::InvalidState {
                    id: session_id.to_string(),
                    status: worker.status,
                    action: "cancel",
                });
            }
            let had_session = matches!(worker.status, WorkerStatus::Running | WorkerStatus::Paused);
            self.finish(
                &mut guard,
                session_id,
                WorkerStatus::Cancelled,
                None,
                Utc::now(),
            );
            had_session
        };
        if had_session && let Err(e) = self.sessions.archive_session(session_id).await {
            debug!(session_id, error = %e, "Archiving cancelled worker failed");
        }
        Ok(())
    }

    /// Queue a fresh attempt for a failed or timed-out worker.
    ///
    /// Returns the new attempt's session id.
    pub async fn retry(&self, session_id: &str) -> Result<String, PoolError> {
        let new_id = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let worker = state
                .workers
                .get(session_id)
                .ok_or_else(|| PoolError::NotFound {
                    id: session_id.to_string(),
                })?
                .clone();
            if !worker.status.is_failure() || !state.is_current(&worker) {
                return Err(PoolError::InvalidState {
                    id: session_id.to_string(),
                    status: worker.status,
                    action: "retry",
                });
            }
            let limit = state
                .contexts
                .get(&worker.orchestration_id)
                .map_or(self.settings.retry_limit, |ctx| ctx.retry_limit);
            if worker.retry_count >= limit {
                return Err(PoolError::RetryLimit {
                    id: session_id.to_string(),
                    limit,
                });
            }
            self.requeue(state, &worker)
        };
        self.drain_queue().await;
        Ok(new_id)
    }

    /// Cancel every live worker of an orchestration. Returns how many were
    /// cancelled.
    pub async fn cancel_orchestration(&self, orchestration_id: &str) -> usize {
        let ids: Vec<String> = self
            .state
            .lock()
            .await
            .workers
            .values()
            .filter(|w| w.orchestration_id == orchestration_id && !w.status.is_terminal())
            .map(|w| w.session_id.clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(&id).await.is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Pause every running worker of an orchestration and hold its queue.
    pub async fn pause_orchestration(&self, orchestration_id: &str) {
        let ids = {
            let mut guard = self.state.lock().await;
            guard.paused.insert(orchestration_id.to_string());
            guard
                .workers
                .values()
                .filter(|w| w.orchestration_id == orchestration_id && w.status == WorkerStatus::Running)
                .map(|w| w.session_id.clone())
                .collect::<Vec<_>>()
        };
        for id in ids {
            let _ = self.pause(&id).await;
        }
    }

    /// Undo [`pause_orchestration`](Self::pause_orchestration).
    pub async fn resume_orchestration(&self, orchestration_id: &str) {
        let ids = {
            let mut guard = self.state.lock().await;
            guard.paused.remove(orchestration_id);
            guard
                .workers
                .values()
                .filter(|w| w.orchestration_id == orchestration_id && w.status == WorkerStatus::Paused)
                .map(|w| w.session_id.clone())
                .collect::<Vec<_>>()
        };
        for id in ids {
            let _ = self.resume(&id).await;
        }
        self.drain_queue().await;
    }

    /// Re-register a worker whose session survived a daemon restart.
    ///
    /// The worker resumes as `running` with a fresh timeout window.
    pub async fn adopt_worker(&self, ctx: &WorkerContext, task: Task, session_id: &str) -> WorkerState {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state
            .contexts
            .insert(ctx.orchestration_id.clone(), ctx.clone());
        if let Some(existing) = state.workers.get(session_id) {
            return existing.clone();
        }
        let attempt = attempt_from_session_id(session_id);
        let mut worker = WorkerState::queued(
            session_id.to_string(),
            &ctx.orchestration_id,
            task,
            attempt,
        );
        worker.status = WorkerStatus::Running;
        worker.started_at = Some(Utc::now());
        info!(session_id, task_id = %worker.task_id, "Adopted worker after restart");
        state.insert_current(worker.clone());
        worker
    }

    /// Forget everything about an orchestration's workers.
    pub async fn remove_orchestration(&self, orchestration_id: &str) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let ids: HashSet<String> = state
            .workers
            .values()
            .filter(|w| w.orchestration_id == orchestration_id)
            .map(|w| w.session_id.clone())
            .collect();
        state.workers.retain(|id, _| !ids.contains(id));
        state.current.retain(|(orch, _), _| orch != orchestration_id);
        state.queue.retain(|id| !ids.contains(id));
        state.watermarks.retain(|id, _| !ids.contains(id));
        state.contexts.remove(orchestration_id);
        state.paused.remove(orchestration_id);
    }

    pub async fn get_worker(&self, session_id: &str) -> Option<WorkerState> {
        self.state.lock().await.workers.get(session_id).cloned()
    }

    /// Current attempt of every task of an orchestration, in queue order.
    pub async fn workers_for(&self, orchestration_id: &str) -> Vec<WorkerState> {
        let guard = self.state.lock().await;
        let mut workers: Vec<WorkerState> = guard
            .current
            .iter()
            .filter(|((orch, _), _)| orch == orchestration_id)
            .filter_map(|(_, id)| guard.workers.get(id).cloned())
            .collect();
        workers.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        workers
    }

    /// Current attempts across every orchestration.
    pub async fn list_workers(&self) -> Vec<WorkerState> {
        let guard = self.state.lock().await;
        let mut workers: Vec<WorkerState> = guard
            .current
            .values()
            .filter_map(|id| guard.workers.get(id).cloned())
            .collect();
        workers.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        workers
    }

    /// Sum tool tallies and count current attempts by status. `None` covers
    /// every orchestration.
    pub async fn get_aggregated_stats(&self, orchestration_id: Option<&str>) -> PoolStats {
        let guard = self.state.lock().await;
        let mut stats = PoolStats {
            max_workers: self.settings.max_workers,
            queued: guard.queue.len(),
            active: guard.active_total(),
            ..PoolStats::default()
        };
        for id in guard.current.values() {
            let Some(worker) = guard.workers.get(id) else {
                continue;
            };
            if orchestration_id.is_some_and(|o| o != worker.orchestration_id) {
                continue;
            }
            stats.total += 1;
            *stats.by_status.entry(worker.status).or_insert(0) += 1;
            stats.tools.add(&worker.tools);
        }
        if let Some(orch) = orchestration_id {
            stats.active = guard.active_for(orch);
            stats.queued = guard
                .queue
                .iter()
                .filter(|id| guard.workers.get(*id).is_some_and(|w| w.orchestration_id == orch))
                .count();
        }
        stats
    }

    /// One output record per task, whatever its worker's status.
    pub async fn collect_outputs(&self, orchestration_id: &str) -> Vec<WorkerOutput> {
        self.workers_for(orchestration_id)
            .await
            .into_iter()
            .map(|w| WorkerOutput {
                task_id: w.task_id,
                title: w.task.title,
                session_id: w.session_id,
                status: w.status,
                output: w.output,
                output_files: w.output_files,
                error: w.error,
            })
            .collect()
    }

    /// Polling loop. Each sweep finishes before the next tick is taken.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.settings.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.poll_all_workers().await;
                }
                _ = shutdown.changed() => {
                    info!("Worker poll loop shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::MemorySessionControl;

    fn settings(max_workers: usize) -> WorkerSettings {
        WorkerSettings {
            max_workers,
            spawn_delay_ms: 0,
            ..WorkerSettings::default()
        }
    }

    fn ctx(orch: &str) -> WorkerContext {
        WorkerContext {
            orchestration_id: orch.to_string(),
            working_dir: PathBuf::from("/tmp/project"),
            prompt: PhasePrompt {
                enabled: true,
                system_prompt: "Worker for {ORCHESTRATION_ID}".into(),
                user_prompt: "Do {TASK_ID}: {TASK_TITLE}".into(),
            },
            variables: Variables::from([("ORCHESTRATION_ID".to_string(), Value::from(orch))]),
            max_workers: 10,
            worker_timeout: Duration::from_secs(60),
            retry_on_error: false,
            retry_limit: 2,
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {id}"),
            description: "work".into(),
            scope: vec!["src/".into()],
            priority: None,
            dependencies: Vec::new(),
            estimated_tokens: None,
            skipped: false,
        }
    }

    fn pool(max: usize) -> (Arc<MemorySessionControl>, WorkerPool) {
        let sessions = Arc::new(MemorySessionControl::new());
        let pool = WorkerPool::new(sessions.clone(), settings(max));
        (sessions, pool)
    }

    #[tokio::test]
    async fn zero_cap_uses_default() {
        let (_, pool) = pool(0);
        assert_eq!(pool.max_workers(), DEFAULT_MAX_WORKERS);
    }

    #[tokio::test]
    async fn spawn_worker_creates_deterministic_session_with_prompt() {
        let (sessions, pool) = pool(2);
        let worker = pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        assert_eq!(worker.session_id, "worker_o1_t1");
        assert_eq!(worker.status, WorkerStatus::Running);
        assert_eq!(
            sessions.user_messages("worker_o1_t1").await,
            vec!["Worker for o1\n\nDo t1: Task t1"]
        );
    }

    #[tokio::test]
    async fn spawn_worker_rejects_when_full() {
        let (_, pool) = pool(1);
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        let err = pool.spawn_worker(&ctx("o1"), task("t2")).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolFull { max: 1 }));
    }

    #[tokio::test]
    async fn spawn_failure_marks_worker_failed() {
        let (sessions, pool) = pool(2);
        sessions.set_create_failure(Some("backend down")).await;
        let err = pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap_err();
        assert!(matches!(err, PoolError::Session(_)));
        let worker = pool.get_worker("worker_o1_t1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Failed);
        assert!(worker.error.unwrap().contains("backend down"));
    }

    #[tokio::test]
    async fn batch_respects_per_orchestration_cap() {
        let (_, pool) = pool(5);
        let mut c = ctx("o1");
        c.max_workers = 2;
        let assigned = pool
            .spawn_batch(&c, vec![task("a"), task("b"), task("c")])
            .await
            .unwrap();
        assert_eq!(assigned.len(), 3);
        let stats = pool.get_aggregated_stats(Some("o1")).await;
        assert_eq!(stats.active, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.by_status.get(&WorkerStatus::Queued), Some(&1));
    }

    #[tokio::test]
    async fn progress_is_clamped_and_emitted_once() {
        let (sessions, pool) = pool(2);
        let mut events = pool.subscribe();
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        sessions
            .push_assistant(
                "worker_o1_t1",
                "<<<MAESTRO_RESPONSE>>>{\"phase\":\"progress\",\"data\":{\"progress\":150,\"current_action\":\"editing\"}}<<<END_MAESTRO_RESPONSE>>>",
            )
            .await
            .unwrap();

        pool.poll_all_workers().await;
        let worker = pool.get_worker("worker_o1_t1").await.unwrap();
        assert!((worker.progress - 99.0).abs() < f64::EPSILON);
        assert_eq!(worker.current_action.as_deref(), Some("editing"));

        pool.poll_all_workers().await;
        let mut progress_events = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.kind, WorkerEventKind::Progress { .. }) {
                progress_events += 1;
            }
        }
        assert_eq!(progress_events, 1);
    }

    #[tokio::test]
    async fn completion_envelope_finishes_worker() {
        let (sessions, pool) = pool(2);
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        sessions
            .push_assistant(
                "worker_o1_t1",
                "Done.\n<<<MAESTRO_RESPONSE>>>{\"phase\":\"completion\",\"data\":{\"success\":true,\"summary\":\"added parser\",\"output_files\":[\"src/p.rs\"]}}<<<END_MAESTRO_RESPONSE>>>",
            )
            .await
            .unwrap();
        pool.poll_all_workers().await;

        let worker = pool.get_worker("worker_o1_t1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Completed);
        assert!((worker.progress - 100.0).abs() < f64::EPSILON);
        assert_eq!(worker.output.as_deref(), Some("added parser"));
        assert_eq!(worker.output_files, vec!["src/p.rs"]);
    }

    #[tokio::test]
    async fn failed_completion_records_error() {
        let (sessions, pool) = pool(2);
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        sessions
            .push_assistant(
                "worker_o1_t1",
                "<<<MAESTRO_RESPONSE>>>{\"phase\":\"completion\",\"data\":{\"success\":false,\"summary\":\"\",\"error\":\"tests fail\"}}<<<END_MAESTRO_RESPONSE>>>",
            )
            .await
            .unwrap();
        pool.poll_all_workers().await;
        let worker = pool.get_worker("worker_o1_t1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Failed);
        assert_eq!(worker.error.as_deref(), Some("tests fail"));
    }

    #[tokio::test]
    async fn pause_resume_only_from_matching_status() {
        let (_, pool) = pool(2);
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        pool.pause("worker_o1_t1").await.unwrap();
        assert!(matches!(
            pool.pause("worker_o1_t1").await,
            Err(PoolError::InvalidState { action: "pause", .. })
        ));
        pool.resume("worker_o1_t1").await.unwrap();
        assert_eq!(
            pool.get_worker("worker_o1_t1").await.unwrap().status,
            WorkerStatus::Running
        );
    }

    #[tokio::test]
    async fn cancel_twice_is_rejected() {
        let (sessions, pool) = pool(2);
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        pool.cancel("worker_o1_t1").await.unwrap();
        assert!(sessions.is_archived("worker_o1_t1").await);
        assert!(pool.cancel("worker_o1_t1").await.is_err());
        assert_eq!(pool.get_aggregated_stats(None).await.active, 0);
    }

    #[tokio::test]
    async fn manual_retry_respects_limit() {
        let (sessions, pool) = pool(2);
        let mut c = ctx("o1");
        c.retry_limit = 1;
        sessions.set_create_failure(Some("flaky")).await;
        let _ = pool.spawn_worker(&c, task("t1")).await;
        sessions.set_create_failure(None).await;

        let retried = pool.retry("worker_o1_t1").await.unwrap();
        assert_eq!(retried, "worker_o1_t1_r1");
        let worker = pool.get_worker(&retried).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Running);
        assert_eq!(worker.retry_count, 1);

        // the superseded attempt cannot be retried again
        assert!(matches!(
            pool.retry("worker_o1_t1").await,
            Err(PoolError::InvalidState { .. })
        ));

        pool.cancel(&retried).await.unwrap();
        assert!(matches!(
            pool.retry(&retried).await,
            Err(PoolError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn retry_limit_reached() {
        let (sessions, pool) = pool(2);
        let mut c = ctx("o1");
        c.retry_limit = 0;
        sessions.set_create_failure(Some("down")).await;
        let _ = pool.spawn_worker(&c, task("t1")).await;
        assert!(matches!(
            pool.retry("worker_o1_t1").await,
            Err(PoolError::RetryLimit { limit: 0, .. })
        ));
    }

    #[tokio::test]
    async fn auto_retry_requeues_failed_worker() {
        let (sessions, pool) = pool(2);
        let mut c = ctx("o1");
        c.retry_on_error = true;
        c.retry_limit = 1;
        pool.spawn_worker(&c, task("t1")).await.unwrap();
        sessions
            .push_assistant(
                "worker_o1_t1",
                "<<<MAESTRO_RESPONSE>>>{\"phase\":\"completion\",\"data\":{\"success\":false,\"error\":\"boom\"}}<<<END_MAESTRO_RESPONSE>>>",
            )
            .await
            .unwrap();
        pool.poll_all_workers().await;

        let workers = pool.workers_for("o1").await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].session_id, "worker_o1_t1_r1");
        assert_eq!(workers[0].status, WorkerStatus::Running);
        assert_eq!(workers[0].retry_count, 1);
    }

    #[tokio::test]
    async fn collect_outputs_covers_every_task() {
        let (sessions, pool) = pool(1);
        pool.spawn_batch(&ctx("o1"), vec![task("a"), task("b")])
            .await
            .unwrap();
        let outputs = pool.collect_outputs("o1").await;
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].status, WorkerStatus::Running);
        assert_eq!(outputs[1].status, WorkerStatus::Queued);
    }

    #[tokio::test]
    async fn paused_orchestration_holds_queue() {
        let (_, pool) = pool(1);
        pool.spawn_batch(&ctx("o1"), vec![task("a"), task("b")])
            .await
            .unwrap();
        pool.pause_orchestration("o1").await;
        pool.cancel("worker_o1_a").await.unwrap();
        assert_eq!(pool.drain_queue().await, 0);
        pool.resume_orchestration("o1").await;
        assert_eq!(
            pool.get_worker("worker_o1_b").await.unwrap().status,
            WorkerStatus::Running
        );
    }

    #[tokio::test]
    async fn adopted_worker_keeps_attempt_number() {
        let (_, pool) = pool(2);
        let worker = pool
            .adopt_worker(&ctx("o1"), task("t1"), "worker_o1_t1_r2")
            .await;
        assert_eq!(worker.status, WorkerStatus::Running);
        assert_eq!(worker.retry_count, 2);
        assert_eq!(pool.workers_for("o1").await.len(), 1);
    }

    #[tokio::test]
    async fn remove_orchestration_forgets_workers() {
        let (_, pool) = pool(2);
        pool.spawn_worker(&ctx("o1"), task("t1")).await.unwrap();
        pool.spawn_worker(&ctx("o2"), task("t1")).await.unwrap();
        pool.remove_orchestration("o1").await;
        assert!(pool.workers_for("o1").await.is_empty());
        assert_eq!(pool.workers_for("o2").await.len(), 1);
    }
}
