//! End-to-end orchestration flows over the in-memory session backend.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use maestro_core::config::{OrchestratorSettings, SubSessionSettings, WorkerSettings};
use maestro_core::protocol::{END_MARKER, START_MARKER};
use maestro_core::{TemplateRegistry, Variables};
use maestro_daemon::orchestration::{
    ConfirmOptions, CreateOrchestration, OrchestrationStatus, Orchestrator, OrchestratorEvent,
    Phase, StateStore, WorkerPool, WorkerStatus,
};
use maestro_daemon::session::{MemorySessionControl, SessionControl};
use maestro_daemon::subsession::{SubSessionStatus, SubSessionTracker};

struct Harness {
    sessions: Arc<MemorySessionControl>,
    orchestrator: Orchestrator,
}

fn harness(sessions: Arc<MemorySessionControl>, state_path: &Path) -> Harness {
    let control: Arc<dyn SessionControl> = sessions.clone();
    let pool = Arc::new(WorkerPool::new(
        control.clone(),
        WorkerSettings {
            max_workers: 4,
            spawn_delay_ms: 0,
            ..WorkerSettings::default()
        },
    ));
    let tracker = Arc::new(SubSessionTracker::new(
        control.clone(),
        SubSessionSettings {
            // the background monitor must not race the explicit sweeps below
            poll_interval_ms: 3_600_000,
            inactivity_threshold_ms: 1_000,
            confirmation_delay_ms: 500,
            ..SubSessionSettings::default()
        },
    ));
    let orchestrator = Orchestrator::new(
        control,
        Arc::new(RwLock::new(TemplateRegistry::with_builtin().unwrap())),
        pool,
        tracker,
        StateStore::new(state_path.to_path_buf(), Duration::from_millis(5)),
        OrchestratorSettings::default(),
    );
    Harness {
        sessions,
        orchestrator,
    }
}

fn envelope(phase: &str, data: &Value) -> String {
    let body = json!({"phase": phase, "data": data});
    format!("Done.\n\n{START_MARKER}\n{body}\n{END_MARKER}\n")
}

fn analysis_reply() -> String {
    envelope(
        "analysis",
        &json!({
            "summary": "Handlers, storage and docs can change independently",
            "recommended_task_count": 3,
            "key_files": ["src/handlers.rs", "src/storage.rs"],
            "complexity": "medium"
        }),
    )
}

fn independent_tasks() -> String {
    envelope(
        "task_list",
        &json!({"tasks": [
            {"id": "t1", "title": "Handlers", "description": "validate inputs in handlers"},
            {"id": "t2", "title": "Storage", "description": "reject invalid rows"},
            {"id": "t3", "title": "Docs", "description": "document the rules"}
        ]}),
    )
}

fn request(template_id: &str) -> CreateOrchestration {
    CreateOrchestration {
        template_id: template_id.into(),
        working_dir: PathBuf::from("/srv/app"),
        user_request: "Add input validation everywhere".into(),
        variables: Variables::new(),
    }
}

async fn status(h: &Harness, id: &str) -> OrchestrationStatus {
    h.orchestrator.get(id).await.unwrap().status
}

#[tokio::test]
async fn analysis_then_task_list_reaches_confirming() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(MemorySessionControl::new()), &dir.path().join("state.json"));
    let mut events = h.orchestrator.subscribe();

    let orch = h.orchestrator.create_and_start(request("default")).await.unwrap();
    let main = orch.main_session_id.clone().unwrap();
    assert_eq!(main, format!("main_{}", orch.id));
    assert_eq!(
        h.sessions.working_dir(&main).await.unwrap(),
        PathBuf::from("/srv/app")
    );

    h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
    assert!(h.orchestrator.poll_orchestrator(&orch.id).await.unwrap());
    let current = h.orchestrator.get(&orch.id).await.unwrap();
    assert_eq!(current.status, OrchestrationStatus::Planning);
    assert_eq!(
        current.analysis.as_ref().unwrap().summary,
        "Handlers, storage and docs can change independently"
    );
    let planning_prompt = h.sessions.user_messages(&main).await.pop().unwrap();
    assert!(planning_prompt.contains("Handlers, storage and docs can change independently"));
    assert!(planning_prompt.contains("about 3 tasks"));

    h.sessions
        .push_assistant(&main, &independent_tasks())
        .await
        .unwrap();
    assert!(h.orchestrator.poll_orchestrator(&orch.id).await.unwrap());
    let current = h.orchestrator.get(&orch.id).await.unwrap();
    assert_eq!(current.status, OrchestrationStatus::Confirming);
    assert_eq!(current.tasks.len(), 3);
    assert_eq!(current.parallel_groups, vec![vec!["t1", "t2", "t3"]]);

    let mut statuses = Vec::new();
    let mut ready = None;
    while let Ok(event) = events.try_recv() {
        match event {
            OrchestratorEvent::StatusChanged { to, .. } => statuses.push(to),
            OrchestratorEvent::TasksReady {
                task_count,
                group_count,
                ..
            } => ready = Some((task_count, group_count)),
            _ => {}
        }
    }
    assert_eq!(
        statuses,
        vec![
            OrchestrationStatus::Analyzing,
            OrchestrationStatus::Planning,
            OrchestrationStatus::Confirming,
        ]
    );
    assert_eq!(ready, Some((3, 1)));
}

#[tokio::test]
async fn transcript_is_consumed_once() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(MemorySessionControl::new()), &dir.path().join("state.json"));
    let orch = h.orchestrator.create_and_start(request("default")).await.unwrap();
    let main = orch.main_session_id.unwrap();

    h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
    assert!(h.orchestrator.poll_orchestrator(&orch.id).await.unwrap());
    let prompts = h.sessions.user_messages(&main).await.len();

    // Nothing new: no state change and no second planning prompt.
    assert!(!h.orchestrator.poll_orchestrator(&orch.id).await.unwrap());
    assert!(!h.orchestrator.poll_orchestrator(&orch.id).await.unwrap());
    assert_eq!(h.sessions.user_messages(&main).await.len(), prompts);
    assert_eq!(status(&h, &orch.id).await, OrchestrationStatus::Planning);
}

#[tokio::test]
async fn analysis_and_task_list_in_one_batch_are_handled_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(MemorySessionControl::new()), &dir.path().join("state.json"));
    let orch = h.orchestrator.create_and_start(request("default")).await.unwrap();
    let main = orch.main_session_id.unwrap();

    h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
    h.sessions
        .push_assistant(&main, &independent_tasks())
        .await
        .unwrap();

    h.orchestrator.poll_orchestrator(&orch.id).await.unwrap();
    assert_eq!(status(&h, &orch.id).await, OrchestrationStatus::Planning);
    h.orchestrator.poll_orchestrator(&orch.id).await.unwrap();
    assert_eq!(status(&h, &orch.id).await, OrchestrationStatus::Confirming);
}

#[tokio::test]
async fn invalid_task_entries_are_dropped_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(MemorySessionControl::new()), &dir.path().join("state.json"));
    let orch = h.orchestrator.create_and_start(request("default")).await.unwrap();
    let main = orch.main_session_id.unwrap();
    h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
    h.orchestrator.poll_orchestrator(&orch.id).await.unwrap();

    h.sessions
        .push_assistant(
            &main,
            &envelope(
                "task_list",
                &json!({"tasks": [
                    {"id": "t1", "title": "Handlers", "description": "validate"},
                    {"id": "t2", "title": "", "description": "no title"},
                    {"id": "t1", "title": "Again", "description": "duplicate"}
                ]}),
            ),
        )
        .await
        .unwrap();
    h.orchestrator.poll_orchestrator(&orch.id).await.unwrap();

    let current = h.orchestrator.get(&orch.id).await.unwrap();
    assert_eq!(current.status, OrchestrationStatus::Confirming);
    assert_eq!(current.tasks.len(), 1);
    assert_eq!(current.tasks[0].title, "Handlers");
    assert!(
        current
            .error_log
            .iter()
            .all(|e| e.phase == Phase::TaskPlanning)
    );
    assert!(current.error_log.len() >= 2);
}

#[tokio::test]
async fn worker_results_feed_the_aggregation_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(MemorySessionControl::new()), &dir.path().join("state.json"));
    let orch = h.orchestrator.create_and_start(request("default")).await.unwrap();
    let (id, main) = (orch.id.clone(), orch.main_session_id.unwrap());
    h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
    h.orchestrator.poll_orchestrator(&id).await.unwrap();
    h.sessions
        .push_assistant(&main, &independent_tasks())
        .await
        .unwrap();
    h.orchestrator.poll_orchestrator(&id).await.unwrap();

    let confirmed = h
        .orchestrator
        .confirm(&id, ConfirmOptions::default())
        .await
        .unwrap();
    assert_eq!(confirmed.status, OrchestrationStatus::Running);
    assert_eq!(confirmed.workers.len(), 3);

    for (task, ok) in [("t1", true), ("t2", true), ("t3", false)] {
        let data = if ok {
            json!({"success": true, "summary": format!("{task} ok"), "output_files": [format!("src/{task}.rs")]})
        } else {
            json!({"success": false, "summary": "gave up", "error": "docs build broken"})
        };
        h.sessions
            .push_assistant(&format!("worker_{id}_{task}"), &envelope("completion", &data))
            .await
            .unwrap();
    }
    h.orchestrator.pool().poll_all_workers().await;
    let workers = h.orchestrator.list_workers(&id).await.unwrap();
    assert!(workers.iter().all(|w| w.status.is_terminal()));
    assert_eq!(
        workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Failed)
            .count(),
        1
    );

    h.orchestrator.poll_orchestrator(&id).await.unwrap();
    assert_eq!(status(&h, &id).await, OrchestrationStatus::Aggregating);
    let prompt = h.sessions.user_messages(&main).await.pop().unwrap();
    assert!(prompt.contains("All 3 workers have finished"));
    assert!(prompt.contains("t1 ok"));
    assert!(prompt.contains("src/t2.rs"));
    assert!(prompt.contains("Error: docs build broken"));

    h.sessions
        .push_assistant(
            &main,
            &envelope(
                "aggregation",
                &json!({"summary": "validation added", "conflicts": [], "output": "see PR"}),
            ),
        )
        .await
        .unwrap();
    h.orchestrator.poll_orchestrator(&id).await.unwrap();
    let done = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(done.status, OrchestrationStatus::Completed);
    assert_eq!(done.aggregation.unwrap().output.as_deref(), Some("see PR"));
}

#[tokio::test]
async fn sub_session_mode_waits_for_children_to_report_back() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(Arc::new(MemorySessionControl::new()), &dir.path().join("state.json"));
    let orch = h
        .orchestrator
        .create_and_start(request("subagents"))
        .await
        .unwrap();
    let (id, main) = (orch.id.clone(), orch.main_session_id.unwrap());
    h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
    h.orchestrator.poll_orchestrator(&id).await.unwrap();
    h.sessions
        .push_assistant(&main, &independent_tasks())
        .await
        .unwrap();
    h.orchestrator.poll_orchestrator(&id).await.unwrap();

    let running = h
        .orchestrator
        .confirm(
            &id,
            ConfirmOptions {
                skip: vec!["t3".into()],
                ..ConfirmOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(running.status, OrchestrationStatus::Running);
    assert_eq!(running.workers.len(), 2);
    let children = h.orchestrator.children(&main).await;
    assert_eq!(children.len(), 2);
    assert!(h.orchestrator.list_workers(&id).await.unwrap().is_empty());

    let child_one = format!("sub_{id}_t1");
    let child_two = format!("sub_{id}_t2");
    h.sessions
        .push_assistant(&child_one, "Handlers now validate every field.")
        .await
        .unwrap();
    h.sessions
        .push_assistant(&child_two, "Storage rejects invalid rows.")
        .await
        .unwrap();

    let tracker = h.orchestrator.tracker();
    let start = Utc::now();
    tracker.poll_once_at(start).await;
    tracker
        .poll_once_at(start + chrono::Duration::seconds(2))
        .await;
    assert!(!h.orchestrator.poll_orchestrator(&id).await.unwrap());
    tracker
        .poll_once_at(start + chrono::Duration::seconds(3))
        .await;
    for child in [&child_one, &child_two] {
        assert_eq!(
            tracker.get(child).await.unwrap().status,
            SubSessionStatus::Returned
        );
    }

    let delivered = h.sessions.user_messages(&main).await;
    assert!(
        delivered
            .iter()
            .any(|m| m.contains("Handlers now validate every field."))
    );

    assert!(h.orchestrator.poll_orchestrator(&id).await.unwrap());
    assert_eq!(status(&h, &id).await, OrchestrationStatus::Aggregating);
    let prompt = h.sessions.user_messages(&main).await.pop().unwrap();
    assert!(prompt.contains("All 2 sub-sessions have reported back"));
}

#[tokio::test]
async fn restart_adopts_running_workers() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let sessions = Arc::new(MemorySessionControl::new());

    let id = {
        let h = harness(sessions.clone(), &state_path);
        let orch = h.orchestrator.create_and_start(request("default")).await.unwrap();
        let main = orch.main_session_id.unwrap();
        h.sessions.push_assistant(&main, &analysis_reply()).await.unwrap();
        h.orchestrator.poll_orchestrator(&orch.id).await.unwrap();
        h.sessions
            .push_assistant(
                &main,
                &envelope(
                    "task_list",
                    &json!({"tasks": [
                        {"id": "t1", "title": "Handlers", "description": "validate"},
                        {"id": "t2", "title": "Storage", "description": "reject"},
                        {"id": "t3", "title": "Docs", "description": "document", "dependencies": ["t1"]}
                    ]}),
                ),
            )
            .await
            .unwrap();
        h.orchestrator.poll_orchestrator(&orch.id).await.unwrap();
        h.orchestrator
            .confirm(&orch.id, ConfirmOptions::default())
            .await
            .unwrap();
        h.orchestrator.flush().await.unwrap();
        orch.id
    };

    // Crash between marking the second group dispatched and spawning it.
    let store = StateStore::new(state_path.clone(), Duration::ZERO);
    let mut saved = store.load().await.unwrap();
    assert_eq!(saved[0].dispatched_groups, 1);
    saved[0].dispatched_groups = 2;
    store.flush(&saved).await.unwrap();

    let h = harness(sessions, &state_path);
    assert_eq!(h.orchestrator.restore().await.unwrap(), 1);
    let restored = h.orchestrator.get(&id).await.unwrap();
    assert_eq!(restored.status, OrchestrationStatus::Running);
    assert_eq!(restored.workers.len(), 3);

    let workers = h.orchestrator.list_workers(&id).await.unwrap();
    assert_eq!(workers.len(), 3);
    assert!(workers.iter().all(|w| w.status == WorkerStatus::Running));
    assert_eq!(
        h.sessions.user_messages(&format!("worker_{id}_t3")).await.len(),
        1
    );
}

#[tokio::test]
async fn restart_keeps_terminal_and_paused_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let sessions = Arc::new(MemorySessionControl::new());

    let (paused, cancelled) = {
        let h = harness(sessions.clone(), &state_path);
        let a = h.orchestrator.create_and_start(request("default")).await.unwrap();
        h.orchestrator.pause(&a.id).await.unwrap();
        let b = h.orchestrator.create(request("default")).await.unwrap();
        h.orchestrator.cancel(&b.id).await.unwrap();
        h.orchestrator.flush().await.unwrap();
        (a.id, b.id)
    };

    let h = harness(sessions, &state_path);
    assert_eq!(h.orchestrator.restore().await.unwrap(), 1);
    assert_eq!(h.orchestrator.list().await.len(), 2);
    assert_eq!(status(&h, &cancelled).await, OrchestrationStatus::Cancelled);

    let resumed = h.orchestrator.resume(&paused).await.unwrap();
    assert_eq!(resumed.status, OrchestrationStatus::Analyzing);
    assert_eq!(resumed.phase, Phase::Analysis);
}
