//! Inactivity-based completion tracking for child sessions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use maestro_core::config::SubSessionSettings;

use crate::orchestration::events::EVENT_CHANNEL_CAPACITY;
use crate::session::{SessionControl, SessionError, TranscriptMessage, last_assistant_text};

use super::types::{
    RegisterOptions, SubSessionError, SubSessionEvent, SubSessionRelation, SubSessionStatus,
};

/// Appended when a child's output is cut to the configured maximum.
pub const TRUNCATION_MARKER: &str = "[... output truncated ...]";

/// Tool names whose invocation spawns a child session.
const SPAWN_TOOLS: &[&str] = &["Task", "Agent"];

#[derive(Debug, Default)]
struct WatchedParent {
    seen_messages: usize,
    seen_tools: HashSet<String>,
}

#[derive(Debug, Clone)]
struct PendingSpawn {
    parent: String,
    spawn_tool_id: String,
    detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerState {
    relations: HashMap<String, SubSessionRelation>,
    /// Parent to children.
    children: HashMap<String, BTreeSet<String>>,
    watched: HashMap<String, WatchedParent>,
    pending: Vec<PendingSpawn>,
    in_flight: HashSet<String>,
}

impl TrackerState {
    fn is_idle(&self) -> bool {
        self.watched.is_empty()
            && self
                .relations
                .values()
                .all(|r| r.status.is_settled())
    }

    fn set_status(
        &mut self,
        child: &str,
        to: SubSessionStatus,
        events: &broadcast::Sender<SubSessionEvent>,
    ) {
        let Some(relation) = self.relations.get_mut(child) else {
            return;
        };
        let from = relation.status;
        if from == to {
            return;
        }
        relation.status = to;
        debug!(child_session_id = child, %from, %to, "Sub-session status changed");
        let _ = events.send(SubSessionEvent::StatusChanged {
            child_session_id: child.to_string(),
            parent_session_id: relation.parent_session_id.clone(),
            from,
            to,
        });
    }
}

/// Tracks parent/child session relations and returns each child's final
/// output to its parent once the child has gone quiet.
pub struct SubSessionTracker {
    sessions: Arc<dyn SessionControl>,
    settings: SubSessionSettings,
    state: Mutex<TrackerState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SubSessionEvent>,
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().is_ok_and(|d| d >= limit)
}

/// Cut `text` to `max` characters (0 = unlimited), marking the cut.
pub fn truncate_output(text: &str, max: usize) -> String {
    if max == 0 {
        return text.to_string();
    }
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n\n{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_string(),
    }
}

fn delivery_message(child: &str, output: Option<&str>) -> String {
    format!(
        "Sub-session {child} has finished. Its final output:\n\n{}",
        output.unwrap_or("(no assistant output)")
    )
}

impl SubSessionTracker {
    pub fn new(sessions: Arc<dyn SessionControl>, settings: SubSessionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions,
            settings,
            state: Mutex::new(TrackerState::default()),
            monitor: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubSessionEvent> {
        self.events.subscribe()
    }

    /// Track `child` under `parent` and make sure the monitor is running.
    pub async fn register_sub_session(
        self: &Arc<Self>,
        child: &str,
        parent: &str,
        options: RegisterOptions,
    ) -> Result<SubSessionRelation, SubSessionError> {
        if child == parent {
            return Err(SubSessionError::SelfParent {
                id: child.to_string(),
            });
        }
        let relation = {
            let mut state = self.state.lock().await;
            if state.relations.contains_key(child) {
                return Err(SubSessionError::AlreadyRegistered {
                    child: child.to_string(),
                });
            }
            let relation = SubSessionRelation::new(
                child.to_string(),
                parent.to_string(),
                options.spawn_tool_id,
                Utc::now(),
            );
            state
                .relations
                .insert(child.to_string(), relation.clone());
            state
                .children
                .entry(parent.to_string())
                .or_default()
                .insert(child.to_string());
            relation
        };
        info!(
            child_session_id = child,
            parent_session_id = parent,
            "Sub-session registered"
        );
        let _ = self.events.send(SubSessionEvent::Registered {
            child_session_id: child.to_string(),
            parent_session_id: parent.to_string(),
            spawn_tool_id: relation.spawn_tool_id.clone(),
        });
        self.ensure_monitor().await;
        Ok(relation)
    }

    async fn ensure_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        debug!("Starting sub-session monitor");
        *monitor = Some(tokio::spawn(Arc::clone(self).monitor_loop()));
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(self.settings.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await; // Skip first immediate tick

        loop {
            timer.tick().await;
            self.poll_once().await;

            // Decide under the monitor lock so a concurrent registration
            // either sees this loop alive or starts a new one.
            let mut monitor = self.monitor.lock().await;
            if self.state.lock().await.is_idle() {
                debug!("No sub-sessions left to monitor; stopping");
                *monitor = None;
                return;
            }
        }
    }

    /// Stop the monitor loop, if running.
    pub async fn stop(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
    }

    /// Whether the monitor loop is currently running.
    pub async fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn poll_once(&self) -> usize {
        self.poll_once_at(Utc::now()).await
    }

    /// One monitoring sweep against an explicit clock: advance every active
    /// relation, deliver newly completed ones, scan watched parents for spawn
    /// calls. Returns the number of child transcripts fetched.
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> usize {
        let (children, parents) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let children: Vec<String> = state
                .relations
                .values()
                .filter(|r| r.status.is_monitored())
                .map(|r| r.child_session_id.clone())
                .filter(|id| !state.in_flight.contains(id))
                .collect();
            state.in_flight.extend(children.iter().cloned());
            let parents: Vec<String> = state.watched.keys().cloned().collect();
            (children, parents)
        };

        let fetched = children.len();
        let mut completed = Vec::new();
        for child in children {
            let transcript = self.sessions.fetch_transcript(&child).await;
            if self.advance(&child, transcript, now).await {
                completed.push(child);
            }
        }
        for child in completed {
            self.deliver(&child, now).await;
        }
        for parent in parents {
            self.scan_parent(&parent, now).await;
        }
        self.purge_pending(now).await;
        fetched
    }

    /// Apply one fetched transcript. Returns true when the relation just
    /// became `completed`.
    async fn advance(
        &self,
        child: &str,
        transcript: Result<Vec<TranscriptMessage>, SessionError>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.in_flight.remove(child);
        let Some(relation) = state.relations.get_mut(child) else {
            return false;
        };
        if !relation.status.is_monitored() {
            return false;
        }

        let messages = match transcript {
            Ok(messages) => messages,
            Err(SessionError::NotFound { .. }) => {
                relation.error = Some("child session no longer exists".into());
                state.set_status(child, SubSessionStatus::Error, &self.events);
                return false;
            }
            Err(e) => {
                warn!(child_session_id = child, error = %e, "Failed to fetch sub-session transcript");
                return false;
            }
        };

        if messages.len() > relation.message_count {
            relation.message_count = messages.len();
            relation.last_activity_at = now;
            if relation.status == SubSessionStatus::Completing {
                relation.completing_since = None;
                state.set_status(child, SubSessionStatus::Active, &self.events);
            }
            return false;
        }

        let status = relation.status;
        match status {
            SubSessionStatus::Active
                if elapsed_at_least(
                    relation.last_activity_at,
                    now,
                    self.settings.inactivity_threshold(),
                ) =>
            {
                relation.completing_since = Some(now);
                state.set_status(child, SubSessionStatus::Completing, &self.events);
                false
            }
            SubSessionStatus::Completing
                if relation.completing_since.is_some_and(|since| {
                    elapsed_at_least(since, now, self.settings.confirmation_delay())
                }) =>
            {
                relation.output = last_assistant_text(&messages)
                    .map(|text| truncate_output(&text, self.settings.max_output_length));
                info!(child_session_id = child, "Sub-session completed");
                state.set_status(child, SubSessionStatus::Completed, &self.events);
                true
            }
            _ => false,
        }
    }

    /// Deliver a completed child's output into its parent. Exactly one
    /// attempt is made; the relation ends `returned`, `orphaned` or `error`.
    async fn deliver(&self, child: &str, now: DateTime<Utc>) {
        let (parent, message) = {
            let state = self.state.lock().await;
            let Some(relation) = state.relations.get(child) else {
                return;
            };
            if relation.status != SubSessionStatus::Completed {
                return;
            }
            (
                relation.parent_session_id.clone(),
                delivery_message(child, relation.output.as_deref()),
            )
        };

        let outcome = match self.sessions.session_exists(&parent).await {
            Ok(false) | Err(SessionError::NotFound { .. }) => Ok(SubSessionStatus::Orphaned),
            Ok(true) => match self.sessions.send_message(&parent, &message).await {
                Ok(()) => Ok(SubSessionStatus::Returned),
                Err(SessionError::NotFound { .. }) => Ok(SubSessionStatus::Orphaned),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(relation) = state.relations.get_mut(child) else {
            return;
        };
        if relation.status != SubSessionStatus::Completed {
            return;
        }
        match outcome {
            Ok(SubSessionStatus::Returned) => {
                relation.returned_at = Some(now);
                info!(child_session_id = child, parent_session_id = %parent, "Sub-session output returned to parent");
                state.set_status(child, SubSessionStatus::Returned, &self.events);
            }
            Ok(status) => {
                warn!(child_session_id = child, parent_session_id = %parent, "Parent session gone; sub-session orphaned");
                state.set_status(child, status, &self.events);
            }
            Err(error) => {
                warn!(child_session_id = child, error = %error, "Delivering sub-session output failed");
                relation.error = Some(error);
                state.set_status(child, SubSessionStatus::Error, &self.events);
            }
        }
    }

    /// Complete a child immediately, skipping the inactivity wait, and
    /// deliver its output.
    pub async fn force_return(&self, child: &str) -> Result<SubSessionRelation, SubSessionError> {
        let status = self
            .get(child)
            .await
            .ok_or_else(|| SubSessionError::NotFound {
                child: child.to_string(),
            })?
            .status;
        if status.is_settled() {
            return Err(SubSessionError::InvalidState {
                child: child.to_string(),
                status,
            });
        }

        let now = Utc::now();
        if status != SubSessionStatus::Completed {
            let messages = self.sessions.fetch_transcript(child).await?;
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let relation =
                state
                    .relations
                    .get_mut(child)
                    .ok_or_else(|| SubSessionError::NotFound {
                        child: child.to_string(),
                    })?;
            if relation.status.is_settled() {
                return Err(SubSessionError::InvalidState {
                    child: child.to_string(),
                    status: relation.status,
                });
            }
            relation.message_count = messages.len();
            relation.output = last_assistant_text(&messages)
                .map(|text| truncate_output(&text, self.settings.max_output_length));
            info!(child_session_id = child, "Sub-session force-returned");
            state.set_status(child, SubSessionStatus::Completed, &self.events);
        }

        self.deliver(child, now).await;
        self.get(child).await.ok_or_else(|| SubSessionError::NotFound {
            child: child.to_string(),
        })
    }

    /// Stop tracking a child.
    pub async fn unregister(&self, child: &str) -> Option<SubSessionRelation> {
        let removed = {
            let mut state = self.state.lock().await;
            let relation = state.relations.remove(child)?;
            if let Some(set) = state.children.get_mut(&relation.parent_session_id) {
                set.remove(child);
                if set.is_empty() {
                    state.children.remove(&relation.parent_session_id);
                }
            }
            relation
        };
        let _ = self.events.send(SubSessionEvent::Unregistered {
            child_session_id: child.to_string(),
        });
        Some(removed)
    }

    pub async fn get(&self, child: &str) -> Option<SubSessionRelation> {
        self.state.lock().await.relations.get(child).cloned()
    }

    /// Every child of `parent`, oldest first.
    pub async fn children(&self, parent: &str) -> Vec<SubSessionRelation> {
        let state = self.state.lock().await;
        let mut children: Vec<SubSessionRelation> = state
            .children
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| state.relations.get(id).cloned())
            .collect();
        children.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.child_session_id.cmp(&b.child_session_id))
        });
        children
    }

    /// Scan `parent`'s transcript for spawn-tool calls so that new sessions
    /// can be linked to it automatically.
    pub async fn watch_parent(self: &Arc<Self>, parent: &str) {
        self.state
            .lock()
            .await
            .watched
            .entry(parent.to_string())
            .or_default();
        self.ensure_monitor().await;
    }

    pub async fn unwatch_parent(&self, parent: &str) {
        let mut state = self.state.lock().await;
        state.watched.remove(parent);
        state.pending.retain(|p| p.parent != parent);
    }

    async fn scan_parent(&self, parent: &str, now: DateTime<Utc>) {
        let messages = match self.sessions.fetch_transcript(parent).await {
            Ok(messages) => messages,
            Err(e) => {
                debug!(parent_session_id = parent, error = %e, "Failed to scan parent transcript");
                return;
            }
        };
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(watch) = state.watched.get_mut(parent) else {
            return;
        };
        let start = watch.seen_messages.min(messages.len());
        for message in messages[start..].iter().filter(|m| m.is_assistant()) {
            for (id, name) in message.content.tool_uses() {
                if !SPAWN_TOOLS.contains(&name) || id.is_empty() || !watch.seen_tools.insert(id.to_string()) {
                    continue;
                }
                debug!(parent_session_id = parent, spawn_tool_id = id, "Spawn call detected");
                state.pending.push(PendingSpawn {
                    parent: parent.to_string(),
                    spawn_tool_id: id.to_string(),
                    detected_at: message.timestamp.unwrap_or(now),
                });
                let _ = self.events.send(SubSessionEvent::SpawnDetected {
                    parent_session_id: parent.to_string(),
                    spawn_tool_id: id.to_string(),
                });
            }
        }
        watch.seen_messages = messages.len();
    }

    async fn purge_pending(&self, now: DateTime<Utc>) {
        let horizon = self.settings.link_window() * 2;
        self.state
            .lock()
            .await
            .pending
            .retain(|p| !elapsed_at_least(p.detected_at, now, horizon));
    }

    /// Report a newly discovered session. If a watched parent made a spawn
    /// call within the link window before `created_at`, the session is registered
    /// as that parent's child (first match wins).
    pub async fn notify_new_session(
        self: &Arc<Self>,
        session_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<SubSessionRelation>, SubSessionError> {
        self.purge_pending(Utc::now()).await;
        let window = self.settings.link_window();
        let matched = {
            let mut state = self.state.lock().await;
            if state.relations.contains_key(session_id) {
                return Ok(None);
            }
            let position = state.pending.iter().position(|p| {
                p.parent != session_id
                    && (created_at - p.detected_at)
                        .to_std()
                        .is_ok_and(|d| d <= window)
            });
            position.map(|i| state.pending.remove(i))
        };
        let Some(spawn) = matched else {
            return Ok(None);
        };
        info!(
            child_session_id = session_id,
            parent_session_id = %spawn.parent,
            spawn_tool_id = %spawn.spawn_tool_id,
            "Linked new session to spawning parent"
        );
        self.register_sub_session(
            session_id,
            &spawn.parent,
            RegisterOptions {
                spawn_tool_id: Some(spawn.spawn_tool_id),
            },
        )
        .await
        .map(Some)
    }

    /// Drop orphaned relations and returned relations older than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_at(max_age, Utc::now()).await
    }

    pub async fn cleanup_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let stale: Vec<String> = {
            let state = self.state.lock().await;
            state
                .relations
                .values()
                .filter(|r| match r.status {
                    SubSessionStatus::Orphaned => true,
                    SubSessionStatus::Returned => r
                        .returned_at
                        .is_none_or(|at| elapsed_at_least(at, now, max_age)),
                    _ => false,
                })
                .map(|r| r.child_session_id.clone())
                .collect()
        };
        for child in &stale {
            self.unregister(child).await;
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "Cleaned up sub-session relations");
        }
        stale.len()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::{ContentBlock, CreateSession, MemorySessionControl, MessageContent, Role};
    use std::path::PathBuf;

    fn settings() -> SubSessionSettings {
        SubSessionSettings {
            poll_interval_ms: 60_000,
            inactivity_threshold_ms: 30_000,
            confirmation_delay_ms: 10_000,
            max_output_length: 20,
            link_window_ms: 60_000,
        }
    }

    async fn session(store: &MemorySessionControl, id: &str) {
        store
            .create_session(CreateSession {
                session_id: Some(id.to_string()),
                working_dir: PathBuf::from("/tmp"),
                message: "start".into(),
                title: None,
            })
            .await
            .unwrap();
    }

    async fn setup() -> (Arc<MemorySessionControl>, Arc<SubSessionTracker>) {
        let store = Arc::new(MemorySessionControl::new());
        session(&store, "parent").await;
        session(&store, "child").await;
        let tracker = Arc::new(SubSessionTracker::new(store.clone(), settings()));
        (store, tracker)
    }

    fn secs(n: i64) -> chrono::TimeDelta {
        chrono::TimeDelta::seconds(n)
    }

    #[test]
    fn truncation_marks_cut_on_char_boundary() {
        assert_eq!(truncate_output("short", 10), "short");
        assert_eq!(truncate_output("héllo wörld", 5), format!("héllo\n\n{TRUNCATION_MARKER}"));
        assert_eq!(truncate_output("anything", 0), "anything");
    }

    #[tokio::test]
    async fn rejects_self_parent_and_duplicates() {
        let (_, tracker) = setup().await;
        assert!(matches!(
            tracker
                .register_sub_session("x", "x", RegisterOptions::default())
                .await,
            Err(SubSessionError::SelfParent { .. })
        ));
        tracker
            .register_sub_session("child", "parent", RegisterOptions::default())
            .await
            .unwrap();
        assert!(tracker.is_monitoring().await);
        assert!(matches!(
            tracker
                .register_sub_session("child", "parent", RegisterOptions::default())
                .await,
            Err(SubSessionError::AlreadyRegistered { .. })
        ));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn inactivity_state_machine_delivers_once() {
        let (store, tracker) = setup().await;
        tracker
            .register_sub_session("child", "parent", RegisterOptions::default())
            .await
            .unwrap();
        store
            .push_assistant("child", "All done, the parser now handles escapes.")
            .await
            .unwrap();
        let t0 = Utc::now();

        tracker.poll_once_at(t0).await;
        assert_eq!(tracker.get("child").await.unwrap().status, SubSessionStatus::Active);

        tracker.poll_once_at(t0 + secs(10)).await;
        assert_eq!(tracker.get("child").await.unwrap().status, SubSessionStatus::Active);

        tracker.poll_once_at(t0 + secs(31)).await;
        assert_eq!(
            tracker.get("child").await.unwrap().status,
            SubSessionStatus::Completing
        );

        tracker.poll_once_at(t0 + secs(42)).await;
        let relation = tracker.get("child").await.unwrap();
        assert_eq!(relation.status, SubSessionStatus::Returned);
        assert_eq!(
            relation.output.as_deref(),
            Some(format!("All done, the parser\n\n{TRUNCATION_MARKER}").as_str())
        );

        tracker.poll_once_at(t0 + secs(100)).await;
        let delivered: Vec<String> = store
            .user_messages("parent")
            .await
            .into_iter()
            .filter(|m| m.contains("Sub-session child"))
            .collect();
        assert_eq!(delivered.len(), 1);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn new_message_reverts_completing_to_active() {
        let (store, tracker) = setup().await;
        tracker
            .register_sub_session("child", "parent", RegisterOptions::default())
            .await
            .unwrap();
        let t0 = Utc::now();
        tracker.poll_once_at(t0).await;
        tracker.poll_once_at(t0 + secs(31)).await;
        assert_eq!(
            tracker.get("child").await.unwrap().status,
            SubSessionStatus::Completing
        );
        store.push_assistant("child", "one more thing").await.unwrap();
        tracker.poll_once_at(t0 + secs(35)).await;
        let relation = tracker.get("child").await.unwrap();
        assert_eq!(relation.status, SubSessionStatus::Active);
        assert!(relation.completing_since.is_none());
        tracker.stop().await;
    }

    #[tokio::test]
    async fn vanished_parent_orphans_relation() {
        let (store, tracker) = setup().await;
        tracker
            .register_sub_session("child", "parent", RegisterOptions::default())
            .await
            .unwrap();
        store.remove("parent").await;
        let relation = tracker.force_return("child").await.unwrap();
        assert_eq!(relation.status, SubSessionStatus::Orphaned);
        assert_eq!(tracker.cleanup(Duration::from_secs(3600)).await, 1);
        assert!(tracker.children("parent").await.is_empty());
        tracker.stop().await;
    }

    #[tokio::test]
    async fn force_return_delivers_immediately() {
        let (store, tracker) = setup().await;
        tracker
            .register_sub_session("child", "parent", RegisterOptions::default())
            .await
            .unwrap();
        store.push_assistant("child", "result").await.unwrap();
        let relation = tracker.force_return("child").await.unwrap();
        assert_eq!(relation.status, SubSessionStatus::Returned);
        assert!(
            store
                .user_messages("parent")
                .await
                .iter()
                .any(|m| m.ends_with("result"))
        );
        assert!(matches!(
            tracker.force_return("child").await,
            Err(SubSessionError::InvalidState { .. })
        ));
        tracker.stop().await;
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_returns() {
        let (_, tracker) = setup().await;
        tracker
            .register_sub_session("child", "parent", RegisterOptions::default())
            .await
            .unwrap();
        tracker.force_return("child").await.unwrap();
        assert_eq!(tracker.cleanup(Duration::from_secs(3600)).await, 0);
        let later = Utc::now() + secs(7200);
        assert_eq!(tracker.cleanup_at(Duration::from_secs(3600), later).await, 1);
        tracker.stop().await;
    }

    #[tokio::test]
    async fn spawn_call_links_next_new_session() {
        let (store, tracker) = setup().await;
        tracker.watch_parent("parent").await;
        store
            .push_message(
                "parent",
                TranscriptMessage {
                    role: Role::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "Task".into(),
                        input: serde_json::json!({"prompt": "write tests"}),
                    }]),
                    timestamp: Some(Utc::now()),
                },
            )
            .await
            .unwrap();
        tracker.poll_once().await;

        let linked = tracker
            .notify_new_session("child", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(linked.parent_session_id, "parent");
        assert_eq!(linked.spawn_tool_id.as_deref(), Some("toolu_1"));

        // the pending spawn was consumed
        session(&store, "other").await;
        assert!(
            tracker
                .notify_new_session("other", Utc::now())
                .await
                .unwrap()
                .is_none()
        );
        tracker.stop().await;
    }

    #[tokio::test]
    async fn spawn_outside_window_is_not_linked() {
        let (store, tracker) = setup().await;
        tracker.watch_parent("parent").await;
        store
            .push_message(
                "parent",
                TranscriptMessage {
                    role: Role::Assistant,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "Task".into(),
                        input: serde_json::Value::Null,
                    }]),
                    timestamp: Some(Utc::now()),
                },
            )
            .await
            .unwrap();
        tracker.poll_once().await;
        let late = Utc::now() + secs(90);
        assert!(tracker.notify_new_session("child", late).await.unwrap().is_none());
        tracker.stop().await;
    }
}
