//! Worker pool scheduling against the in-memory session backend.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use maestro_core::Variables;
use maestro_core::config::WorkerSettings;
use maestro_core::protocol::{END_MARKER, START_MARKER};
use maestro_core::template::PhasePrompt;
use maestro_daemon::orchestration::events::WorkerEventKind;
use maestro_daemon::orchestration::{Task, WorkerContext, WorkerPool, WorkerStatus};
use maestro_daemon::session::MemorySessionControl;

fn pool(max_workers: usize) -> (Arc<MemorySessionControl>, WorkerPool) {
    let sessions = Arc::new(MemorySessionControl::new());
    let settings = WorkerSettings {
        max_workers,
        spawn_delay_ms: 0,
        ..WorkerSettings::default()
    };
    (sessions.clone(), WorkerPool::new(sessions, settings))
}

fn ctx(max_workers: usize, timeout: Duration) -> WorkerContext {
    WorkerContext {
        orchestration_id: "orch".into(),
        working_dir: PathBuf::from("/srv/app"),
        prompt: PhasePrompt {
            enabled: true,
            system_prompt: String::new(),
            user_prompt: "{TASK_ID}: {TASK_DESCRIPTION}".into(),
        },
        variables: Variables::new(),
        max_workers,
        worker_timeout: timeout,
        retry_on_error: false,
        retry_limit: 0,
    }
}

fn task(id: &str) -> Task {
    Task {
        id: id.into(),
        title: format!("Task {id}"),
        description: format!("implement {id}"),
        scope: Vec::new(),
        priority: None,
        dependencies: Vec::new(),
        estimated_tokens: None,
        skipped: false,
    }
}

fn completion(summary: &str) -> String {
    let body: Value = json!({"phase": "completion", "data": {"success": true, "summary": summary}});
    format!("{START_MARKER}\n{body}\n{END_MARKER}")
}

#[tokio::test]
async fn cancelled_worker_frees_slot_for_queued_task() {
    let (sessions, pool) = pool(1);
    let ctx = ctx(10, Duration::from_secs(600));
    let assigned = pool
        .spawn_batch(&ctx, vec![task("t1"), task("t2")])
        .await
        .unwrap();
    assert_eq!(
        assigned,
        vec![
            ("t1".to_string(), "worker_orch_t1".to_string()),
            ("t2".to_string(), "worker_orch_t2".to_string()),
        ]
    );

    let first = pool.get_worker("worker_orch_t1").await.unwrap();
    let second = pool.get_worker("worker_orch_t2").await.unwrap();
    assert_eq!(first.status, WorkerStatus::Running);
    assert_eq!(second.status, WorkerStatus::Queued);
    assert_eq!(sessions.created_sessions().await, vec!["worker_orch_t1"]);

    pool.cancel("worker_orch_t1").await.unwrap();
    assert!(sessions.is_archived("worker_orch_t1").await);

    pool.poll_all_workers().await;
    let second = pool.get_worker("worker_orch_t2").await.unwrap();
    assert_eq!(second.status, WorkerStatus::Running);
    assert_eq!(
        sessions.user_messages("worker_orch_t2").await,
        vec!["t2: implement t2"]
    );
}

#[tokio::test]
async fn stale_running_worker_times_out_without_new_output() {
    let (sessions, pool) = pool(2);
    let ctx = ctx(2, Duration::from_secs(30));
    pool.spawn_batch(&ctx, vec![task("t1")]).await.unwrap();
    let mut events = pool.subscribe();

    let started = pool
        .get_worker("worker_orch_t1")
        .await
        .unwrap()
        .started_at
        .unwrap();
    pool.poll_all_workers_at(started + chrono::Duration::seconds(10))
        .await;
    assert_eq!(
        pool.get_worker("worker_orch_t1").await.unwrap().status,
        WorkerStatus::Running
    );

    pool.poll_all_workers_at(started + chrono::Duration::seconds(31))
        .await;
    let worker = pool.get_worker("worker_orch_t1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Timeout);
    assert!(worker.error.is_some());

    let mut timed_out = false;
    while let Ok(event) = events.try_recv() {
        if let WorkerEventKind::StatusChanged { to, .. } = event.kind {
            timed_out |= to == WorkerStatus::Timeout;
        }
    }
    assert!(timed_out);

    // A completion that shows up after the deadline does not revive it.
    sessions
        .push_assistant("worker_orch_t1", &completion("late"))
        .await
        .unwrap();
    pool.poll_all_workers_at(Utc::now()).await;
    let worker = pool.get_worker("worker_orch_t1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Timeout);
    assert!(worker.output.is_none());
}

#[tokio::test]
async fn timed_out_worker_can_be_retried_once() {
    let (sessions, pool) = pool(2);
    let mut ctx = ctx(2, Duration::from_secs(30));
    ctx.retry_limit = 1;
    pool.spawn_batch(&ctx, vec![task("t1")]).await.unwrap();
    let started = pool
        .get_worker("worker_orch_t1")
        .await
        .unwrap()
        .started_at
        .unwrap();
    pool.poll_all_workers_at(started + chrono::Duration::minutes(5))
        .await;

    let retried = pool.retry("worker_orch_t1").await.unwrap();
    assert_eq!(retried, "worker_orch_t1_r1");
    let attempt = pool.get_worker(&retried).await.unwrap();
    assert_eq!(attempt.status, WorkerStatus::Running);
    assert_eq!(attempt.retry_count, 1);
    assert_eq!(
        sessions.created_sessions().await,
        vec!["worker_orch_t1", "worker_orch_t1_r1"]
    );

    let attempt_started = attempt.started_at.unwrap();
    pool.poll_all_workers_at(attempt_started + chrono::Duration::minutes(5))
        .await;
    assert!(pool.retry(&retried).await.is_err());
}

#[tokio::test]
async fn completion_releases_slot_for_next_task() {
    let (sessions, pool) = pool(1);
    let ctx = ctx(1, Duration::from_secs(600));
    pool.spawn_batch(&ctx, vec![task("a"), task("b")])
        .await
        .unwrap();

    sessions
        .push_assistant("worker_orch_a", &completion("a finished"))
        .await
        .unwrap();
    pool.poll_all_workers().await;
    assert_eq!(
        pool.get_worker("worker_orch_a").await.unwrap().status,
        WorkerStatus::Completed
    );
    assert_eq!(
        pool.get_worker("worker_orch_b").await.unwrap().status,
        WorkerStatus::Running
    );

    let outputs = pool.collect_outputs("orch").await;
    assert_eq!(outputs.len(), 2);
    let a = outputs.iter().find(|o| o.task_id == "a").unwrap();
    assert_eq!(a.status, WorkerStatus::Completed);
}

#[tokio::test]
async fn session_created_after_cancel_is_archived() {
    let (sessions, pool) = pool(1);
    let pool = Arc::new(pool);
    sessions.hold_creates().await;

    let spawning = {
        let pool = pool.clone();
        let ctx = ctx(1, Duration::from_secs(600));
        tokio::spawn(async move { pool.spawn_batch(&ctx, vec![task("t1")]).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pool
            .get_worker("worker_orch_t1")
            .await
            .is_some_and(|w| w.status == WorkerStatus::Spawning)
        {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    pool.cancel("worker_orch_t1").await.unwrap();
    sessions.release_create().await;
    spawning.await.unwrap().unwrap();

    assert_eq!(sessions.created_sessions().await, vec!["worker_orch_t1"]);
    assert!(sessions.is_archived("worker_orch_t1").await);
    assert_eq!(
        pool.get_worker("worker_orch_t1").await.unwrap().status,
        WorkerStatus::Cancelled
    );
}
