//! In-process session store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};

use super::{CreateSession, SessionControl, SessionError, TranscriptMessage};

#[derive(Debug, Clone)]
struct MemorySession {
    working_dir: PathBuf,
    title: Option<String>,
    messages: Vec<TranscriptMessage>,
    archived: bool,
    created_at: DateTime<Utc>,
}

/// [`SessionControl`] backed by a map. Requested ids are honoured; when none
/// is given an id of the form `session_{n}` is assigned.
#[derive(Debug, Default)]
pub struct MemorySessionControl {
    sessions: RwLock<HashMap<String, MemorySession>>,
    order: RwLock<Vec<String>>,
    counter: AtomicU64,
    fail_creates: RwLock<Option<String>>,
    create_gate: RwLock<Option<Arc<Notify>>>,
}

impl MemorySessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an assistant reply to a session's transcript.
    pub async fn push_assistant(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
        self.push_message(session_id, TranscriptMessage::assistant(text))
            .await
    }

    /// Append an arbitrary message to a session's transcript.
    pub async fn push_message(
        &self,
        session_id: &str,
        message: TranscriptMessage,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })?;
        session.messages.push(message);
        Ok(())
    }

    /// Remove a session entirely, as if it were deleted upstream.
    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Make every subsequent `create_session` fail with `reason` (`None` to
    /// clear).
    pub async fn set_create_failure(&self, reason: Option<&str>) {
        *self.fail_creates.write().await = reason.map(ToString::to_string);
    }

    /// Make `create_session` wait for [`Self::release_create`] before it
    /// completes. Each release lets one pending create through.
    pub async fn hold_creates(&self) {
        *self.create_gate.write().await = Some(Arc::new(Notify::new()));
    }

    pub async fn release_create(&self) {
        if let Some(gate) = self.create_gate.read().await.as_ref() {
            gate.notify_one();
        }
    }

    /// Session ids in creation order.
    pub async fn created_sessions(&self) -> Vec<String> {
        self.order.read().await.clone()
    }

    /// User messages sent to a session, oldest first.
    pub async fn user_messages(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| {
                s.messages
                    .iter()
                    .filter(|m| !m.is_assistant())
                    .map(|m| m.content.plain_text())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_archived(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(session_id)
            .is_some_and(|s| s.archived)
    }

    pub async fn working_dir(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.working_dir.clone())
    }

    pub async fn title(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.title.clone())
    }

    pub async fn created_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.created_at)
    }
}

#[async_trait]
impl SessionControl for MemorySessionControl {
    async fn create_session(&self, request: CreateSession) -> Result<String, SessionError> {
        if let Some(reason) = self.fail_creates.read().await.clone() {
            return Err(SessionError::Transport(reason));
        }
        let gate = self.create_gate.read().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let id = request.session_id.unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            format!("session_{n}")
        });

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(SessionError::Api {
                status: 409,
                message: format!("session {id} already exists"),
            });
        }
        sessions.insert(
            id.clone(),
            MemorySession {
                working_dir: request.working_dir,
                title: request.title,
                messages: vec![TranscriptMessage::user(request.message)],
                archived: false,
                created_at: Utc::now(),
            },
        );
        drop(sessions);
        self.order.write().await.push(id.clone());
        Ok(id)
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<(), SessionError> {
        self.push_message(session_id, TranscriptMessage::user(message))
            .await
    }

    async fn fetch_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptMessage>, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })
    }

    async fn archive_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })?;
        session.archived = true;
        Ok(())
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, SessionError> {
        Ok(self.sessions.read().await.contains_key(session_id))
    }
}
