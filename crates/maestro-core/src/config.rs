//! Configuration resolution for Maestro.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/maestro/settings.json)
//! 3. Project config (.maestro/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete Maestro configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub workers: WorkerSettings,
    #[serde(default)]
    pub subsessions: SubSessionSettings,
}

/// Daemon-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Persisted orchestration state (JSON array of records).
    pub state_path: Option<PathBuf>,
    /// Directory holding user templates (`*.json` / `*.toml`).
    pub templates_dir: Option<PathBuf>,
    /// Base URL of the session-control HTTP API.
    pub session_api_url: Option<String>,
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            templates_dir: None,
            session_api_url: None,
            log_level: "info".to_string(),
        }
    }
}

/// Orchestrator polling and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub poll_interval_ms: u64,
    /// Quiet period before a scheduled state write hits the disk.
    pub persist_debounce_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            persist_debounce_ms: 1_000,
        }
    }
}

impl OrchestratorSettings {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Worker pool defaults. Templates may override `max_workers`,
/// `worker_timeout_ms` and `retry_limit` per orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub worker_timeout_ms: u64,
    pub retry_limit: u32,
    /// Pause between consecutive session creations.
    pub spawn_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_workers: 3,
            poll_interval_ms: 5_000,
            worker_timeout_ms: 30 * 60 * 1_000, // 30 minutes
            retry_limit: 2,
            spawn_delay_ms: 2_000,
        }
    }
}

impl WorkerSettings {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub const fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }
}

/// Inactivity-based subsession tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubSessionSettings {
    pub poll_interval_ms: u64,
    pub inactivity_threshold_ms: u64,
    pub confirmation_delay_ms: u64,
    /// Maximum characters delivered back to the parent session.
    pub max_output_length: usize,
    /// How long a detected spawn-tool call may wait for its child session.
    pub link_window_ms: u64,
}

impl Default for SubSessionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            inactivity_threshold_ms: 30_000,
            confirmation_delay_ms: 10_000,
            max_output_length: 50_000,
            link_window_ms: 60_000,
        }
    }
}

impl SubSessionSettings {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }

    pub const fn confirmation_delay(&self) -> Duration {
        Duration::from_millis(self.confirmation_delay_ms)
    }

    pub const fn link_window(&self) -> Duration {
        Duration::from_millis(self.link_window_ms)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".maestro").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Default location of the persisted orchestration state.
pub fn default_state_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("orchestrations.json"))
}

/// Default directory for user templates.
pub fn default_templates_dir() -> Option<PathBuf> {
    config_dir().map(|p| p.join("templates"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".maestro"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/maestro"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("maestro"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.daemon.state_path.is_some() {
        base.daemon.state_path = overlay.daemon.state_path;
    }
    if overlay.daemon.templates_dir.is_some() {
        base.daemon.templates_dir = overlay.daemon.templates_dir;
    }
    if overlay.daemon.session_api_url.is_some() {
        base.daemon.session_api_url = overlay.daemon.session_api_url;
    }
    base.daemon.log_level = overlay.daemon.log_level;

    base.orchestrator = overlay.orchestrator;
    base.workers = overlay.workers;
    base.subsessions = overlay.subsessions;
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("MAESTRO_STATE_PATH") {
        config.daemon.state_path = Some(PathBuf::from(val));
    }
    if let Some(val) = var("MAESTRO_TEMPLATES_DIR") {
        config.daemon.templates_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = var("MAESTRO_SESSION_API_URL") {
        config.daemon.session_api_url = Some(val);
    }
    if let Some(val) = var("MAESTRO_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(n) = var("MAESTRO_MAX_WORKERS").and_then(|v| v.parse().ok()) {
        config.workers.max_workers = n;
    }
    if let Some(n) = var("MAESTRO_WORKER_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.workers.worker_timeout_ms = n;
    }
    if let Some(n) = var("MAESTRO_RETRY_LIMIT").and_then(|v| v.parse().ok()) {
        config.workers.retry_limit = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_timeout_is_30_minutes() {
        let config = Config::default();
        assert_eq!(config.workers.worker_timeout(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"workers":{"max_workers":8}}"#).unwrap();
        assert_eq!(config.workers.max_workers, 8);
        assert_eq!(config.workers.retry_limit, 2);
        assert_eq!(config.subsessions.inactivity_threshold_ms, 30_000);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "MAESTRO_MAX_WORKERS" => Some("7".into()),
            "MAESTRO_RETRY_LIMIT" => Some("not-a-number".into()),
            "MAESTRO_SESSION_API_URL" => Some("http://localhost:8080".into()),
            _ => None,
        });
        assert_eq!(config.workers.max_workers, 7);
        assert_eq!(config.workers.retry_limit, 2);
        assert_eq!(
            config.daemon.session_api_url.as_deref(),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let maestro_dir = dir.path().join(".maestro");
        std::fs::create_dir_all(&maestro_dir).unwrap();
        std::fs::write(
            maestro_dir.join("settings.json"),
            r#"{"subsessions":{"confirmation_delay_ms":2500}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.subsessions.confirmation_delay_ms, 2_500);
    }
}
