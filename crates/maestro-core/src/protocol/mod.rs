//! Orchestrator response protocol.
//!
//! Agents embed a marker-delimited JSON envelope (`{"phase": .., "data": ..}`)
//! anywhere in their free-form replies. This module locates and decodes
//! envelopes into the closed [`PhaseData`] sum type, validates them per
//! phase, and offers a separate low-confidence [`fallback`] detector for
//! replies that ignore the protocol.

pub mod fallback;
mod parser;
mod types;
mod validate;

pub use fallback::{FallbackHint, HintPhase};
pub use parser::{END_MARKER, START_MARKER, has_envelope, parse, parse_multiple, wrap};
pub use types::*;
pub use validate::validate;
