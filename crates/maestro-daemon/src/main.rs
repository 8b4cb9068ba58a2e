//! Maestro Daemon
//!
//! Restores persisted orchestrations, then drives the orchestrator, worker
//! pool and sub-session tracker against a session API until shutdown.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::RwLock;
use tracing::{info, warn};

use maestro_core::config::{default_state_path, default_templates_dir, load_config};
use maestro_core::tracing_init::{default_filter, init_tracing};
use maestro_core::TemplateRegistry;
use maestro_daemon::orchestration::{CreateOrchestration, Orchestrator, StateStore, WorkerPool};
use maestro_daemon::session::{HttpSessionConfig, HttpSessionControl, SessionControl};
use maestro_daemon::subsession::SubSessionTracker;

/// Settled sub-session relations older than this are dropped.
const SUB_SESSION_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "maestro-daemon")]
#[command(version, about = "Maestro daemon - multi-session orchestration")]
struct Args {
    /// Project directory used for `.maestro/settings.json` lookup
    #[arg(long, env = "MAESTRO_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Base URL of the session API
    #[arg(long, env = "MAESTRO_SESSION_API_URL")]
    session_api_url: Option<String>,

    /// Bearer token for the session API
    #[arg(long, env = "MAESTRO_SESSION_API_TOKEN")]
    session_api_token: Option<String>,

    /// Per-request timeout for the session API, in seconds
    #[arg(long, default_value_t = 30, env = "MAESTRO_SESSION_API_TIMEOUT")]
    session_api_timeout: u64,

    /// Orchestration state file
    #[arg(long, env = "MAESTRO_STATE_PATH")]
    state_path: Option<PathBuf>,

    /// Directory of user templates (`*.json` / `*.toml`)
    #[arg(long, env = "MAESTRO_TEMPLATES_DIR")]
    templates_dir: Option<PathBuf>,

    /// Global worker cap (overrides config)
    #[arg(long, env = "MAESTRO_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "MAESTRO_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "MAESTRO_LOG_JSON")]
    log_json: bool,

    /// Start an orchestration for this request once the daemon is up
    #[arg(long, requires = "working_dir")]
    request: Option<String>,

    /// Working directory for `--request`
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Template for `--request`
    #[arg(long, default_value = "default")]
    template: String,

    /// Template variable for `--request`, as KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.project_dir.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    init_tracing(&default_filter("maestro_daemon", &log_level), args.log_json);

    if let Some(max) = args.max_workers {
        config.workers.max_workers = max;
    }
    let base_url = args
        .session_api_url
        .clone()
        .or_else(|| config.daemon.session_api_url.clone())
        .ok_or_else(|| anyhow::anyhow!("No session API URL configured"))?;
    let state_path = args
        .state_path
        .clone()
        .or_else(|| config.daemon.state_path.clone())
        .or_else(default_state_path)
        .ok_or_else(|| anyhow::anyhow!("Cannot determine state file path"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        session_api = %base_url,
        state_path = %state_path.display(),
        max_workers = config.workers.max_workers,
        "Starting maestro-daemon"
    );

    let sessions: Arc<dyn SessionControl> = Arc::new(HttpSessionControl::new(&HttpSessionConfig {
        base_url,
        token: args.session_api_token.clone(),
        timeout: Duration::from_secs(args.session_api_timeout),
    })?);

    let mut registry = TemplateRegistry::with_builtin()?;
    let templates_dir = args
        .templates_dir
        .clone()
        .or_else(|| config.daemon.templates_dir.clone())
        .or_else(default_templates_dir);
    if let Some(dir) = templates_dir.filter(|d| d.is_dir()) {
        let loaded = registry.load_dir(&dir)?;
        info!(dir = %dir.display(), loaded, "Loaded user templates");
    }

    let pool = Arc::new(WorkerPool::new(sessions.clone(), config.workers.clone()));
    let tracker = Arc::new(SubSessionTracker::new(
        sessions.clone(),
        config.subsessions.clone(),
    ));
    let store = StateStore::new(state_path, config.orchestrator.persist_debounce());
    let orchestrator = Arc::new(Orchestrator::new(
        sessions,
        Arc::new(RwLock::new(registry)),
        pool.clone(),
        tracker.clone(),
        store,
        config.orchestrator.clone(),
    ));

    let restored = orchestrator.restore().await?;
    info!(restored, "Orchestration state restored");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool_handle = tokio::spawn(pool.run(shutdown_rx.clone()));
    let orchestrator_handle = tokio::spawn(Arc::clone(&orchestrator).run(shutdown_rx.clone()));
    let cleanup_handle = {
        let tracker = tracker.clone();
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(SUB_SESSION_RETENTION / 4);
            timer.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        tracker.cleanup(SUB_SESSION_RETENTION).await;
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    };

    if let Some(request) = args.request {
        let working_dir = args.working_dir.unwrap_or_default();
        let variables: BTreeMap<_, _> = args
            .vars
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        match orchestrator
            .create_and_start(CreateOrchestration {
                template_id: args.template,
                working_dir,
                user_request: request,
                variables,
            })
            .await
        {
            Ok(orch) => info!(orchestration_id = %orch.id, "Orchestration started"),
            Err(e) => warn!(error = %e, "Failed to start orchestration"),
        }
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = pool_handle.await;
    let _ = orchestrator_handle.await;
    let _ = cleanup_handle.await;
    tracker.stop().await;
    orchestrator.flush().await?;

    info!("Daemon stopped");
    Ok(())
}
