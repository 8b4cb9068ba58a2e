//! Maestro Daemon Library
//!
//! Runtime side of Maestro:
//! - Orchestration state machine, worker pool and state persistence
//! - Sub-session tracking and result delivery
//! - Session backend abstraction with HTTP and in-memory implementations

pub mod orchestration;
pub mod session;
pub mod subsession;
