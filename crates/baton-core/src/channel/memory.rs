//! In-memory command channel.
//!
//! Stands in for the external runtime when embedding the engine without a
//! filesystem protocol, and in tests: commands are recorded, and statuses
//! are injected with [`InMemoryChannel::respond`] / [`InMemoryChannel::respond_to_step`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ensure_active, match_invocation, ChannelError, CommandArtifact, CommandChannel, PollResult,
    StatusArtifact, StatusState,
};
use crate::worktree::ExecutionContext;

#[derive(Default)]
struct Mailbox {
    /// In send order
    commands: Vec<CommandArtifact>,
    /// Context id (== invocation id) → latest status written by the "runtime"
    statuses: HashMap<String, StatusArtifact>,
    fail_sends: bool,
}

#[derive(Clone, Default)]
pub struct InMemoryChannel {
    inner: Arc<Mutex<Mailbox>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent `send` fail with a write error.
    pub fn fail_sends(&self, fail: bool) {
        self.mailbox().fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<CommandArtifact> {
        self.mailbox().commands.clone()
    }

    /// Latest command sent for `step`, if any.
    pub fn command_for_step(&self, step: &str) -> Option<CommandArtifact> {
        self.mailbox()
            .commands
            .iter()
            .rev()
            .find(|c| c.step == step)
            .cloned()
    }

    /// Write a status artifact as the runtime would.
    pub fn respond(&self, status: StatusArtifact) {
        self.mailbox()
            .statuses
            .insert(status.invocation_id.clone(), status);
    }

    /// Answer the latest command for `step`. Returns false if none was sent.
    pub fn respond_to_step(&self, step: &str, state: StatusState) -> bool {
        match self.command_for_step(step) {
            Some(cmd) => {
                self.respond(StatusArtifact::new(cmd.invocation_id, state));
                true
            }
            None => false,
        }
    }
}

impl CommandChannel for InMemoryChannel {
    fn send(
        &self,
        ctx: &ExecutionContext,
        command: CommandArtifact,
    ) -> Result<CommandArtifact, ChannelError> {
        ensure_active(ctx)?;
        let mut mailbox = self.mailbox();
        if mailbox.fail_sends {
            return Err(ChannelError::Write("injected write failure".into()));
        }
        if mailbox
            .commands
            .iter()
            .any(|c| c.invocation_id == command.invocation_id)
        {
            return Err(ChannelError::AlreadySent(command.invocation_id));
        }
        mailbox.commands.push(command.clone());
        Ok(command)
    }

    fn poll(&self, ctx: &ExecutionContext, invocation_id: &str) -> Result<PollResult, ChannelError> {
        match self.mailbox().statuses.get(&ctx.id) {
            Some(status) => Ok(match_invocation(status.clone(), invocation_id)),
            None => Ok(PollResult::Pending),
        }
    }
}
