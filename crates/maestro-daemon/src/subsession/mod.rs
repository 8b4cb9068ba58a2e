//! Parent/child session tracking.
//!
//! A child session is considered finished once it has been quiet for the
//! inactivity threshold and stays quiet through a confirmation delay. Its
//! last assistant message is then delivered into the parent.

mod tracker;
mod types;

pub use tracker::{SubSessionTracker, TRUNCATION_MARKER, truncate_output};
pub use types::{
    RegisterOptions, SubSessionError, SubSessionEvent, SubSessionRelation, SubSessionStatus,
};
