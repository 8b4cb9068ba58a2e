//! Sub-session tracking against the in-memory session backend.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use maestro_core::config::SubSessionSettings;
use maestro_daemon::session::{
    ContentBlock, CreateSession, MemorySessionControl, MessageContent, Role, SessionControl,
    TranscriptMessage,
};
use maestro_daemon::subsession::{
    RegisterOptions, SubSessionEvent, SubSessionStatus, SubSessionTracker, TRUNCATION_MARKER,
};

fn tracker(
    sessions: &Arc<MemorySessionControl>,
    max_output_length: usize,
) -> Arc<SubSessionTracker> {
    let control: Arc<dyn SessionControl> = sessions.clone();
    Arc::new(SubSessionTracker::new(
        control,
        SubSessionSettings {
            poll_interval_ms: 3_600_000,
            inactivity_threshold_ms: 10_000,
            confirmation_delay_ms: 2_000,
            max_output_length,
            link_window_ms: 5_000,
        },
    ))
}

async fn session(sessions: &MemorySessionControl, id: &str) -> String {
    sessions
        .create_session(CreateSession {
            session_id: Some(id.into()),
            working_dir: PathBuf::from("/srv/app"),
            message: "start".into(),
            title: None,
        })
        .await
        .unwrap()
}

fn spawn_call(tool_id: &str) -> TranscriptMessage {
    spawn_call_at(tool_id, Utc::now())
}

fn spawn_call_at(tool_id: &str, at: chrono::DateTime<Utc>) -> TranscriptMessage {
    TranscriptMessage {
        role: Role::Assistant,
        content: MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "Delegating the migration.".into(),
            },
            ContentBlock::ToolUse {
                id: tool_id.into(),
                name: "Task".into(),
                input: json!({"prompt": "write the migration"}),
            },
        ]),
        timestamp: Some(at),
    }
}

/// Drive a relation through active → completing → completed.
async fn settle(tracker: &SubSessionTracker) {
    let start = Utc::now();
    tracker.poll_once_at(start).await;
    tracker.poll_once_at(start + Duration::seconds(11)).await;
    tracker.poll_once_at(start + Duration::seconds(14)).await;
}

#[tokio::test]
async fn spawned_child_is_linked_and_reports_back() {
    let sessions = Arc::new(MemorySessionControl::new());
    let tracker = tracker(&sessions, 0);
    let mut events = tracker.subscribe();

    let parent = session(&sessions, "parent").await;
    tracker.watch_parent(&parent).await;
    sessions
        .push_message(&parent, spawn_call("toolu_01"))
        .await
        .unwrap();
    tracker.poll_once().await;

    let child = session(&sessions, "child").await;
    let created_at = sessions.created_at(&child).await.unwrap();
    let relation = tracker
        .notify_new_session(&child, created_at)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.parent_session_id, parent);
    assert_eq!(relation.spawn_tool_id.as_deref(), Some("toolu_01"));

    // The spawn call is used up by the first match.
    let other = session(&sessions, "other").await;
    assert!(
        tracker
            .notify_new_session(&other, created_at)
            .await
            .unwrap()
            .is_none()
    );

    sessions
        .push_assistant(&child, "Migration written to db/002.sql")
        .await
        .unwrap();
    settle(&tracker).await;

    let relation = tracker.get(&child).await.unwrap();
    assert_eq!(relation.status, SubSessionStatus::Returned);
    assert!(relation.returned_at.is_some());
    let delivered = sessions.user_messages(&parent).await.pop().unwrap();
    assert!(delivered.contains("Sub-session child has finished"));
    assert!(delivered.contains("Migration written to db/002.sql"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SubSessionEvent::SpawnDetected { spawn_tool_id, .. } => {
                seen.push(format!("spawn:{spawn_tool_id}"));
            }
            SubSessionEvent::Registered { .. } => seen.push("registered".into()),
            SubSessionEvent::StatusChanged { to, .. } => seen.push(to.to_string()),
            SubSessionEvent::Unregistered { .. } => seen.push("unregistered".into()),
        }
    }
    assert_eq!(
        seen,
        vec![
            "spawn:toolu_01",
            "registered",
            "completing",
            "completed",
            "returned"
        ]
    );
}

#[tokio::test]
async fn child_of_deleted_parent_is_orphaned() {
    let sessions = Arc::new(MemorySessionControl::new());
    let tracker = tracker(&sessions, 0);
    let parent = session(&sessions, "parent").await;
    let child = session(&sessions, "child").await;
    tracker
        .register_sub_session(&child, &parent, RegisterOptions::default())
        .await
        .unwrap();
    sessions.push_assistant(&child, "done").await.unwrap();
    sessions.remove(&parent).await;

    settle(&tracker).await;
    assert_eq!(
        tracker.get(&child).await.unwrap().status,
        SubSessionStatus::Orphaned
    );
    assert_eq!(tracker.cleanup(std::time::Duration::from_secs(3600)).await, 1);
    assert!(tracker.get(&child).await.is_none());
    assert!(tracker.children(&parent).await.is_empty());
}

#[tokio::test]
async fn long_output_is_truncated_before_delivery() {
    let sessions = Arc::new(MemorySessionControl::new());
    let tracker = tracker(&sessions, 16);
    let parent = session(&sessions, "parent").await;
    let child = session(&sessions, "child").await;
    tracker
        .register_sub_session(&child, &parent, RegisterOptions::default())
        .await
        .unwrap();
    sessions
        .push_assistant(&child, &"x".repeat(100))
        .await
        .unwrap();

    settle(&tracker).await;
    let relation = tracker.get(&child).await.unwrap();
    let output = relation.output.unwrap();
    assert!(output.starts_with(&"x".repeat(16)));
    assert!(output.ends_with(TRUNCATION_MARKER));
    assert!(!output.contains(&"x".repeat(17)));
}

#[tokio::test]
async fn child_activity_during_confirmation_resets_to_active() {
    let sessions = Arc::new(MemorySessionControl::new());
    let tracker = tracker(&sessions, 0);
    let parent = session(&sessions, "parent").await;
    let child = session(&sessions, "child").await;
    tracker
        .register_sub_session(&child, &parent, RegisterOptions::default())
        .await
        .unwrap();

    let start = Utc::now();
    tracker.poll_once_at(start).await;
    tracker.poll_once_at(start + Duration::seconds(11)).await;
    assert_eq!(
        tracker.get(&child).await.unwrap().status,
        SubSessionStatus::Completing
    );

    sessions
        .push_assistant(&child, "one more thing")
        .await
        .unwrap();
    tracker.poll_once_at(start + Duration::seconds(12)).await;
    let relation = tracker.get(&child).await.unwrap();
    assert_eq!(relation.status, SubSessionStatus::Active);
    assert!(relation.completing_since.is_none());
    assert_eq!(sessions.user_messages(&parent).await.len(), 1);
}

#[tokio::test]
async fn session_created_before_spawn_call_is_not_linked() {
    let sessions = Arc::new(MemorySessionControl::new());
    let tracker = tracker(&sessions, 0);
    let parent = session(&sessions, "parent").await;
    tracker.watch_parent(&parent).await;

    let early = session(&sessions, "early").await;
    let created_at = sessions.created_at(&early).await.unwrap();
    sessions
        .push_message(
            &parent,
            spawn_call_at("toolu_02", created_at + Duration::seconds(2)),
        )
        .await
        .unwrap();
    tracker.poll_once().await;

    assert!(
        tracker
            .notify_new_session(&early, created_at)
            .await
            .unwrap()
            .is_none()
    );
    assert!(tracker.get(&early).await.is_none());

    // The pending spawn is still there for the real child.
    let relation = tracker
        .notify_new_session("late", created_at + Duration::seconds(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relation.parent_session_id, parent);
}
