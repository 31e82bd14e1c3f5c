//! Error types for the Baton engine.
//!
//! `EngineError` is what callers of the engine see. Step-level failures are
//! never raised through it: they are captured as [`StepError`] values on the
//! failed step's record so that the run status always carries the most
//! specific diagnostic per step.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad workflow definition or mode-resolution inputs. The run never starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(e: crate::config::ConfigError) -> Self {
        EngineError::Configuration(e.to_string())
    }
}

/// Kind of a step-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepErrorKind {
    /// The worktree for a delegated step could not be created.
    ContextAcquisition,
    /// The command artifact could not be written.
    ChannelWrite,
    /// The external runtime did not answer within the step's wait budget.
    PollTimeout,
    /// The local check ran and failed.
    LocalAction,
    /// The external runtime reported the delegated action as failed.
    DelegatedAction,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepErrorKind::ContextAcquisition => "ContextAcquisitionError",
            StepErrorKind::ChannelWrite => "ChannelWriteError",
            StepErrorKind::PollTimeout => "PollTimeoutError",
            StepErrorKind::LocalAction => "LocalActionError",
            StepErrorKind::DelegatedAction => "DelegatedActionError",
        };
        write!(f, "{}", s)
    }
}

/// Diagnostic attached to a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    /// Hint for the caller that re-running the step may succeed.
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind == StepErrorKind::PollTimeout,
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(StepError::new(StepErrorKind::PollTimeout, "slow").retryable);
        assert!(!StepError::new(StepErrorKind::ChannelWrite, "ro fs").retryable);
        assert!(!StepError::new(StepErrorKind::ContextAcquisition, "lock").retryable);
        assert!(!StepError::new(StepErrorKind::LocalAction, "lint").retryable);
    }

    #[test]
    fn test_display_uses_taxonomy_names() {
        let err = StepError::new(StepErrorKind::PollTimeout, "no status after 30s");
        assert_eq!(err.to_string(), "PollTimeoutError: no status after 30s");
    }
}
