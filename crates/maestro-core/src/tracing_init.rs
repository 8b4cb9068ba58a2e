//! Shared tracing/logging initialization.
//!
//! The daemon binary and the integration harnesses use the same pattern:
//! an env-filter scoped to the maestro crates plus optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a binary crate.
///
/// Both the binary crate and `maestro_core` log at `level`; everything else
/// stays at `warn` so dependency chatter does not drown orchestration logs.
pub fn default_filter(binary_crate: &str, level: &str) -> String {
    format!("warn,{binary_crate}={level},maestro_core={level}")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is not set
///   (see [`default_filter`]).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}
