//! Workflow definitions and per-run mode resolution.
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► resolve_workflow(flags)
//!                                               │
//!                                    Vec<ResolvedStep> (immutable per run)
//! ```

pub mod mode;
pub mod schema;
pub mod template;

pub use mode::{resolve, resolve_workflow, ExecutionMode, GlobalFlags, ModeResolution, ModeSource};
pub use schema::{
    DelegateTemplate, LocalAction, OnFailure, Step, StepGroup, WorkflowConfig, WorkflowDefinition,
};
pub use template::TemplateContext;
