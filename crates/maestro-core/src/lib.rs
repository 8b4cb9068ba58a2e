//! `Maestro` Core Library
//!
//! Shared functionality for `Maestro` components:
//! - Response protocol parsing (marker-delimited JSON envelopes)
//! - Workflow templates with inheritance and placeholder substitution
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod template;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use template::{Template, TemplateRegistry, Variables};
