//! Workflow templates: inheritance resolution and prompt placeholders.

mod registry;
mod substitute;
mod types;

use std::path::PathBuf;

pub use registry::{TemplateRegistry, deep_merge};
pub use substitute::{stringify, substitute, unresolved};
pub use types::{
    ExecutionMode, PhasePrompt, PhaseSet, Template, TemplateConfig, TemplateSummary, Variables,
};

/// Errors from template resolution and mutation.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template not found: {id}")]
    NotFound { id: String },

    #[error("Template '{id}' extends unknown template '{parent}'")]
    MissingParent { id: String, parent: String },

    #[error("Template already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Cannot {action} system template '{id}'")]
    SystemTemplate { id: String, action: &'static str },

    #[error("Circular template inheritance: {chain}")]
    CircularInheritance { chain: String },

    #[error("Template '{id}' is extended by: {}", dependents.join(", "))]
    InUse { id: String, dependents: Vec<String> },

    #[error("Invalid template {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("Template I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
