//! improve - autonomous improvement loop
//!
//! Runs agent-driven plan/implement/review pipelines in isolated git
//! worktrees, merges their branches one at a time, and keeps the task
//! backlog in step with what actually merged.

pub mod event_log;
pub mod git;
pub mod merge_queue;
pub mod orchestrator;
pub mod pipeline;
pub mod reconcile;
pub mod render;
pub mod runner;
pub mod validator;
pub mod workspace;

pub use event_log::EventLog;
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use reconcile::ReconciliationEngine;
