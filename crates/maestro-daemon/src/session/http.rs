//! Session API client over HTTP/JSON.
//!
//! Endpoints (relative to the configured base URL):
//! - `POST   /api/sessions`                 create, returns `{"id": ...}`
//! - `POST   /api/sessions/{id}/messages`   send a user message
//! - `GET    /api/sessions/{id}/messages`   full transcript
//! - `POST   /api/sessions/{id}/archive`    archive
//! - `GET    /api/sessions/{id}`            existence (404 = gone)

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CreateSession, SessionControl, SessionError, TranscriptMessage};

/// Configuration for connecting to a session API.
#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    /// Base URL (e.g., "<http://127.0.0.1:3000>").
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: std::time::Duration,
}

/// HTTP implementation of [`SessionControl`].
#[derive(Debug)]
pub struct HttpSessionControl {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    working_directory: PathBuf,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(alias = "sessionId", alias = "session_id")]
    id: String,
}

#[derive(Serialize)]
struct MessageBody<'a> {
    content: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptResponse {
    Bare(Vec<TranscriptMessage>),
    Wrapped { messages: Vec<TranscriptMessage> },
}

impl HttpSessionControl {
    pub fn new(config: &HttpSessionConfig) -> Result<Self, SessionError> {
        if config.base_url.is_empty() {
            return Err(SessionError::Config("base_url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| SessionError::Config("Invalid token format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        // reqwest is built with rustls-no-provider; `Err` means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn session_url(&self, session_id: &str, suffix: &str) -> String {
        let encoded = session_id.replace('/', "%2F");
        self.api_url(&format!("/sessions/{encoded}{suffix}"))
    }

    fn check_status(session_id: &str, resp: &reqwest::Response) -> Result<(), SessionError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SessionError::NotFound {
                id: session_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SessionError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SessionControl for HttpSessionControl {
    async fn create_session(&self, request: CreateSession) -> Result<String, SessionError> {
        let body = CreateBody {
            session_id: request.session_id.as_deref(),
            working_directory: request.working_dir.clone(),
            message: &request.message,
            title: request.title.as_deref(),
        };
        let resp = self
            .http
            .post(self.api_url("/sessions"))
            .json(&body)
            .send()
            .await?;
        Self::check_status(request.session_id.as_deref().unwrap_or("<new>"), &resp)?;
        let created: CreateResponse = resp.json().await?;
        debug!(session_id = %created.id, "Created session");
        Ok(created.id)
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<(), SessionError> {
        let resp = self
            .http
            .post(self.session_url(session_id, "/messages"))
            .json(&MessageBody { content: message })
            .send()
            .await?;
        Self::check_status(session_id, &resp)
    }

    async fn fetch_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptMessage>, SessionError> {
        let resp = self
            .http
            .get(self.session_url(session_id, "/messages"))
            .send()
            .await?;
        Self::check_status(session_id, &resp)?;
        Ok(match resp.json::<TranscriptResponse>().await? {
            TranscriptResponse::Bare(messages) | TranscriptResponse::Wrapped { messages } => {
                messages
            }
        })
    }

    async fn archive_session(&self, session_id: &str) -> Result<(), SessionError> {
        let resp = self
            .http
            .post(self.session_url(session_id, "/archive"))
            .send()
            .await?;
        Self::check_status(session_id, &resp)
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, SessionError> {
        let resp = self.http.get(self.session_url(session_id, "")).send().await?;
        match Self::check_status(session_id, &resp) {
            Ok(()) => Ok(true),
            Err(SessionError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
