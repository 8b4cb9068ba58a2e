//! Multi-session orchestration.
//!
//! - [`Orchestrator`]: per-orchestration phase state machine driven by the
//!   main session's structured replies.
//! - [`WorkerPool`]: concurrency-capped worker sessions with queueing,
//!   timeouts and retries.
//! - [`StateStore`]: debounced JSON persistence used for crash recovery.
//! - [`scheduler`]: dependency layering of planned tasks into parallel
//!   groups.

pub mod events;
pub mod manager;
pub mod persistence;
pub mod pool;
pub mod scheduler;
pub mod tools;
pub mod types;

pub use events::{OrchestratorEvent, WorkerEvent, WorkerEventKind};
pub use manager::{ConfirmOptions, CreateOrchestration, Orchestrator, OrchestratorError};
pub use persistence::{StateStore, StoreError};
pub use pool::{PoolError, WorkerContext, WorkerPool};
pub use types::{
    Orchestration, OrchestrationStatus, OrchestrationSummary, Phase, Task, WorkerOutput,
    WorkerState, WorkerStatus,
};
