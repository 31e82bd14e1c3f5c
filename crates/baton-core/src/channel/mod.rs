//! Command channel — the request/response protocol with the external runtime.
//!
//! The engine writes one [`CommandArtifact`] per delegated invocation into
//! the invocation's execution context; the external runtime answers by
//! writing a [`StatusArtifact`]. The two live at distinct well-known
//! locations and the engine never reads its own command back.
//!
//! ```text
//! <context>/.baton/command.json   engine → runtime   (write-once)
//! <context>/.baton/status.json    runtime → engine   (Running → Succeeded | Failed)
//! ```

pub mod file;
pub mod memory;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worktree::{ContextState, ExecutionContext};

pub use file::FileCommandChannel;
pub use memory::InMemoryChannel;

/// Wire-format version written into every command artifact.
pub const PROTOCOL_VERSION: u32 = 1;

/// The request half of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandArtifact {
    pub version: u32,
    pub invocation_id: String,
    pub run_id: String,
    pub step: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl CommandArtifact {
    pub fn new(
        run_id: impl Into<String>,
        step: impl Into<String>,
        invocation_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            invocation_id: invocation_id.into(),
            run_id: run_id.into(),
            step: step.into(),
            action: action.into(),
            input: None,
            params: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Running,
    Succeeded,
    Failed,
}

/// The response half of the protocol, produced only by the external runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusArtifact {
    /// Must match the command it answers
    pub invocation_id: String,
    pub state: StatusState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusArtifact {
    pub fn new(invocation_id: impl Into<String>, state: StatusState) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            state,
            result: None,
            error: None,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StatusState::Succeeded | StatusState::Failed)
    }
}

/// Outcome of a non-blocking poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    /// No (valid, matching) status artifact yet
    Pending,
    Status(StatusArtifact),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Context {id} is {state:?}; commands can only be sent into an active context")]
    NotActive { id: String, state: ContextState },

    #[error("A command was already sent for invocation {0}")]
    AlreadySent(String),

    #[error("Failed to write command artifact: {0}")]
    Write(String),

    #[error("Failed to read status artifact: {0}")]
    Read(String),
}

/// Transport between the engine and the external runtime.
///
/// `send` is called exactly once per invocation; `poll` must be cheap and
/// must report a missing status artifact as [`PollResult::Pending`].
pub trait CommandChannel: Send + Sync {
    fn send(
        &self,
        ctx: &ExecutionContext,
        command: CommandArtifact,
    ) -> Result<CommandArtifact, ChannelError>;

    fn poll(&self, ctx: &ExecutionContext, invocation_id: &str) -> Result<PollResult, ChannelError>;
}

pub(crate) fn ensure_active(ctx: &ExecutionContext) -> Result<(), ChannelError> {
    if ctx.is_active() {
        Ok(())
    } else {
        Err(ChannelError::NotActive {
            id: ctx.id.clone(),
            state: ctx.state,
        })
    }
}

/// Accept a status only if it answers `invocation_id`.
pub(crate) fn match_invocation(status: StatusArtifact, invocation_id: &str) -> PollResult {
    if status.invocation_id == invocation_id {
        PollResult::Status(status)
    } else {
        tracing::warn!(
            "[Channel] Ignoring status for invocation {} while waiting on {}",
            status.invocation_id,
            invocation_id
        );
        PollResult::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let json = r#"{
            "invocationId": "inv-1",
            "state": "succeeded",
            "result": {"pr": 42}
        }"#;
        let status: StatusArtifact = serde_json::from_str(json).unwrap();
        assert_eq!(status.state, StatusState::Succeeded);
        assert!(status.is_terminal());
        assert_eq!(status.result.unwrap()["pr"], 42);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_command_wire_format_uses_camel_case() {
        let mut cmd = CommandArtifact::new("run-1", "open-pr", "inv-1", "open_pr");
        cmd.input = Some("Open a PR".into());
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["invocationId"], "inv-1");
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["version"], PROTOCOL_VERSION);
        assert!(value.get("createdAt").is_some());
        assert!(value.get("params").is_none());
    }

    #[test]
    fn test_mismatched_invocation_is_pending() {
        let status = StatusArtifact::new("other", StatusState::Succeeded);
        assert_eq!(match_invocation(status, "mine"), PollResult::Pending);
    }
}
