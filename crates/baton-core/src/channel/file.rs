//! File-based command channel.
//!
//! Commands are published atomically: the JSON is written to a temp file and
//! hard-linked into place, so the runtime never sees a half-written command
//! and a second send for the same context fails instead of overwriting.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use super::{
    ensure_active, match_invocation, ChannelError, CommandArtifact, CommandChannel, PollResult,
    StatusArtifact,
};
use crate::worktree::ExecutionContext;

/// Directory inside each context holding the protocol files.
pub const PROTOCOL_DIR: &str = ".baton";
pub const COMMAND_FILE: &str = "command.json";
pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, Default)]
pub struct FileCommandChannel;

impl FileCommandChannel {
    pub fn new() -> Self {
        Self
    }

    pub fn command_path(ctx: &ExecutionContext) -> PathBuf {
        ctx.path.join(PROTOCOL_DIR).join(COMMAND_FILE)
    }

    pub fn status_path(ctx: &ExecutionContext) -> PathBuf {
        ctx.path.join(PROTOCOL_DIR).join(STATUS_FILE)
    }
}

impl CommandChannel for FileCommandChannel {
    fn send(
        &self,
        ctx: &ExecutionContext,
        command: CommandArtifact,
    ) -> Result<CommandArtifact, ChannelError> {
        ensure_active(ctx)?;

        let dir = ctx.path.join(PROTOCOL_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| ChannelError::Write(format!("{}: {}", dir.display(), e)))?;

        let target = Self::command_path(ctx);
        if target.exists() {
            return Err(ChannelError::AlreadySent(command.invocation_id));
        }

        let json = serde_json::to_vec_pretty(&command)
            .map_err(|e| ChannelError::Write(e.to_string()))?;

        let tmp = dir.join(format!("{}.{}.tmp", COMMAND_FILE, command.invocation_id));
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| ChannelError::Write(format!("{}: {}", tmp.display(), e)))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| ChannelError::Write(format!("{}: {}", tmp.display(), e)))?;
        }

        let linked = fs::hard_link(&tmp, &target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ChannelError::AlreadySent(command.invocation_id));
            }
            Err(e) => {
                return Err(ChannelError::Write(format!("{}: {}", target.display(), e)));
            }
        }

        tracing::info!(
            "[Channel] Sent {} for {}/{} → {}",
            command.action,
            command.run_id,
            command.step,
            target.display()
        );
        Ok(command)
    }

    fn poll(&self, ctx: &ExecutionContext, invocation_id: &str) -> Result<PollResult, ChannelError> {
        let path = Self::status_path(ctx);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PollResult::Pending),
            Err(e) => return Err(ChannelError::Read(format!("{}: {}", path.display(), e))),
        };

        match serde_json::from_str::<StatusArtifact>(&content) {
            Ok(status) => Ok(match_invocation(status, invocation_id)),
            Err(e) => {
                // The runtime may be mid-write; try again next tick.
                tracing::debug!(
                    "[Channel] Unreadable status at {}: {}",
                    path.display(),
                    e
                );
                Ok(PollResult::Pending)
            }
        }
    }
}
