//! Typed view of a fully-resolved workflow template.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::substitute::substitute;

/// Placeholder values keyed by `UPPER_SNAKE_CASE` name.
pub type Variables = BTreeMap<String, Value>;

/// A workflow template after inheritance has been flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub phases: PhaseSet,
    #[serde(default)]
    pub config: TemplateConfig,
    /// Default placeholder values; orchestration overrides win.
    #[serde(default)]
    pub variables: Variables,
}

/// Prompt configuration for every workflow phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhaseSet {
    pub analysis: PhasePrompt,
    pub task_planning: PhasePrompt,
    pub worker_execution: PhasePrompt,
    pub aggregation: PhasePrompt,
    pub verification: PhasePrompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhasePrompt {
    pub enabled: bool,
    pub system_prompt: String,
    pub user_prompt: String,
}

impl Default for PhasePrompt {
    fn default() -> Self {
        Self {
            enabled: true,
            system_prompt: String::new(),
            user_prompt: String::new(),
        }
    }
}

impl PhasePrompt {
    /// Enabled and carrying at least one prompt.
    pub fn is_active(&self) -> bool {
        self.enabled && !(self.system_prompt.trim().is_empty() && self.user_prompt.trim().is_empty())
    }

    /// Render the system/user pair into a single message.
    pub fn render(&self, vars: &Variables) -> String {
        let system = substitute(&self.system_prompt, vars);
        let user = substitute(&self.user_prompt, vars);
        match (system.trim().is_empty(), user.trim().is_empty()) {
            (true, _) => user,
            (false, true) => system,
            (false, false) => format!("{system}\n\n{user}"),
        }
    }
}

/// How the worker-execution phase is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Worker pool with progress/completion envelopes.
    #[default]
    Workers,
    /// Child sessions tracked by inactivity, results returned to the main session.
    Subsessions,
}

/// Runtime knobs carried by a template.
///
/// `None` means "use the daemon default". Keys this struct does not know are
/// kept in `extra` so they survive inheritance and round-trips.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_timeout_ms: Option<u64>,
    pub retry_on_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    pub execution_mode: ExecutionMode,
    pub auto_confirm: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Listing entry for the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub extends: Option<String>,
    pub is_system: bool,
}
