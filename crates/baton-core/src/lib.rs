//! Baton Core — a workflow engine that runs each step locally or hands it
//! to an external agent runtime.
//!
//! Delegated steps get an isolated execution context (a git worktree or a
//! plain directory) and talk to the runtime through a file-based command
//! channel: the engine writes a command artifact, the runtime answers with
//! a status artifact, and a single per-run poller picks it up. Run state is
//! persisted in SQLite after every step transition so runs can be resumed
//! after a restart.
//!
//! This crate has no CLI dependency; `baton-cli` is one front end over it.

pub mod channel;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod git;
pub mod poller;
pub mod run;
pub mod store;
pub mod workflow;
pub mod worktree;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use engine::Engine;
pub use error::{EngineError, StepError, StepErrorKind};
pub use events::EngineEvent;
pub use run::{RunFilter, RunSnapshot, RunStatus, StepRecord, StepState, WorkflowRun};
pub use workflow::{ExecutionMode, GlobalFlags, WorkflowDefinition};
