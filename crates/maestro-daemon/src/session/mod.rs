//! Session-control seam.
//!
//! The orchestrator never talks to a chat backend directly; it goes through
//! the [`SessionControl`] trait, which covers the minimum surface it needs:
//! create, send, fetch transcript, archive, and existence checks.
//!
//! - [`HttpSessionControl`]: JSON-over-HTTP client for a session API.
//! - [`MemorySessionControl`]: in-process store used by tests and dry runs.

mod http;
mod memory;
mod transcript;

use std::path::PathBuf;

use async_trait::async_trait;

pub use http::{HttpSessionConfig, HttpSessionControl};
pub use memory::MemorySessionControl;
pub use transcript::{ContentBlock, MessageContent, Role, TranscriptMessage, last_assistant_text};

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct CreateSession {
    /// Requested identifier. Backends that assign their own ids may ignore it;
    /// callers must use the returned id.
    pub session_id: Option<String>,
    /// Initial working directory.
    pub working_dir: PathBuf,
    /// First user message.
    pub message: String,
    /// Display title.
    pub title: Option<String>,
}

/// Minimum surface required from the session-control collaborator.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Create a session and send its first message. Returns the session id.
    async fn create_session(&self, request: CreateSession) -> Result<String, SessionError>;

    /// Send a user message into an existing session.
    async fn send_message(&self, session_id: &str, message: &str) -> Result<(), SessionError>;

    /// Fetch the complete, ordered transcript.
    async fn fetch_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptMessage>, SessionError>;

    /// Archive (close) a session.
    async fn archive_session(&self, session_id: &str) -> Result<(), SessionError>;

    /// Whether the session still exists.
    async fn session_exists(&self, session_id: &str) -> Result<bool, SessionError>;
}

/// Errors from the session-control collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Session API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session transport error: {0}")]
    Transport(String),
}
