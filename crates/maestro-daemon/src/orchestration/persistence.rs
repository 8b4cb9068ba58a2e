//! Crash-recovery state file.
//!
//! The whole orchestration table is written as one JSON array. Writes are
//! debounced: each [`StateStore::schedule`] replaces the pending write, so a
//! burst of mutations produces one write of the latest snapshot. Files are
//! replaced atomically (temp file + rename).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::types::Orchestration;

/// Errors from the state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("State file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Debounced JSON persistence for orchestrations.
pub struct StateStore {
    path: PathBuf,
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl StateStore {
    pub fn new(path: PathBuf, debounce: Duration) -> Self {
        Self {
            path,
            debounce,
            pending: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted orchestration. A missing file means no prior
    /// state.
    pub async fn load(&self) -> Result<Vec<Orchestration>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file; starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let orchestrations: Vec<Orchestration> = serde_json::from_str(&contents)?;
        info!(
            path = %self.path.display(),
            count = orchestrations.len(),
            "Loaded orchestration state"
        );
        Ok(orchestrations)
    }

    /// Schedule a write of `snapshot`, superseding any pending write.
    pub async fn schedule(&self, snapshot: &[Orchestration]) {
        let json = match serde_json::to_string_pretty(snapshot) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize orchestration state");
                return;
            }
        };
        let path = self.path.clone();
        let debounce = self.debounce;

        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = write_atomic(&path, &json).await {
                error!(error = %e, "Failed to persist orchestration state");
            }
        }));
    }

    /// Cancel any pending write and write `snapshot` now.
    pub async fn flush(&self, snapshot: &[Orchestration]) -> Result<(), StoreError> {
        if let Some(handle) = self.pending.lock().await.take() {
            handle.abort();
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.path, &json).await
    }
}

async fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    debug!(path = %path.display(), bytes = contents.len(), "State written");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestration::types::{OrchestrationStatus, Phase};
    use maestro_core::{Template, Variables};

    fn orchestration(id: &str) -> Orchestration {
        let template: Template =
            serde_json::from_value(serde_json::json!({"id": "default", "name": "Default"}))
                .unwrap();
        Orchestration::new(
            id.to_string(),
            template,
            PathBuf::from("/tmp/project"),
            "build it".into(),
            Variables::new(),
        )
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), Duration::ZERO);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn flush_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"), Duration::ZERO);
        let mut orch = orchestration("o1");
        orch.enter_phase(Phase::TaskPlanning);
        orch.workers.insert("t1".into(), "worker_o1_t1".into());

        store.flush(&[orch.clone()]).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![orch]);
        assert_eq!(loaded[0].status, OrchestrationStatus::Planning);
    }

    #[tokio::test]
    async fn schedule_debounces_to_latest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(path.clone(), Duration::from_millis(50));

        store.schedule(&[orchestration("first")]).await;
        store.schedule(&[orchestration("second")]).await;
        assert!(!path.exists(), "write must wait for the debounce window");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "second");
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = StateStore::new(path, Duration::ZERO);
        assert!(matches!(store.load().await, Err(StoreError::Json(_))));
    }
}
