//! Worktree manager — isolated execution contexts for delegated steps.
//!
//! Each delegated invocation gets its own directory under
//! `<root>/<run_id>/<step>-<invocation>`. Lifecycle:
//!
//! ```text
//! Created ──► Active ──► Completed | Failed | Abandoned ──► Reclaimed
//! ```
//!
//! Release only marks a context; deletion happens in `sweep` (after the
//! retention window) or an explicit `reclaim`. A context pinned by an
//! in-flight poll registration is never deleted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ProvisionerKind;
use crate::git;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Created,
    Active,
    Completed,
    Failed,
    Abandoned,
    Reclaimed,
}

impl ContextState {
    pub fn is_released(&self) -> bool {
        matches!(
            self,
            ContextState::Completed | ContextState::Failed | ContextState::Abandoned
        )
    }
}

/// Terminal outcome reported when a step releases its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Same as the invocation id that owns it
    pub id: String,
    pub run_id: String,
    pub step_name: String,
    pub path: PathBuf,
    pub state: ContextState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn is_active(&self) -> bool {
        self.state == ContextState::Active
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Failed to acquire context for invocation {invocation}: {reason}")]
    Acquisition { invocation: String, reason: String },

    #[error("Unknown context: {0}")]
    NotFound(String),

    #[error("Context {id} is {state:?}; expected {expected}")]
    InvalidState {
        id: String,
        state: ContextState,
        expected: &'static str,
    },

    #[error("Context {0} is still referenced by an in-flight poll")]
    Pinned(String),

    #[error("Failed to remove context {id}: {reason}")]
    Removal { id: String, reason: String },
}

#[derive(Default)]
struct Registry {
    contexts: HashMap<String, ExecutionContext>,
    pins: HashMap<String, usize>,
}

impl Registry {
    fn is_pinned(&self, id: &str) -> bool {
        self.pins.get(id).copied().unwrap_or(0) > 0
    }
}

/// Thread-safe handle; clones share the same registry.
#[derive(Clone)]
pub struct WorktreeManager {
    root: PathBuf,
    repo_root: PathBuf,
    provisioner: ProvisionerKind,
    retention: Duration,
    inner: Arc<Mutex<Registry>>,
}

impl WorktreeManager {
    pub fn new(
        root: impl Into<PathBuf>,
        repo_root: impl Into<PathBuf>,
        provisioner: ProvisionerKind,
        retention: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            repo_root: repo_root.into(),
            provisioner,
            retention,
            inner: Arc::new(Mutex::new(Registry::default())),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves the map itself consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh working copy for one delegated invocation.
    pub fn acquire(
        &self,
        run_id: &str,
        step_name: &str,
        invocation_id: &str,
    ) -> Result<ExecutionContext, ContextError> {
        let path = self
            .root
            .join(sanitize(run_id))
            .join(format!("{}-{}", sanitize(step_name), sanitize(invocation_id)));

        let acquisition_err = |reason: String| ContextError::Acquisition {
            invocation: invocation_id.to_string(),
            reason,
        };

        {
            let mut reg = self.registry();
            if reg.contexts.contains_key(invocation_id) {
                return Err(acquisition_err("invocation already owns a context".into()));
            }
            if path.exists() || reg.contexts.values().any(|c| c.path == path) {
                return Err(acquisition_err(format!(
                    "path {} is already in use",
                    path.display()
                )));
            }
            reg.contexts.insert(
                invocation_id.to_string(),
                ExecutionContext {
                    id: invocation_id.to_string(),
                    run_id: run_id.to_string(),
                    step_name: step_name.to_string(),
                    path: path.clone(),
                    state: ContextState::Created,
                    created_at: Utc::now(),
                    released_at: None,
                },
            );
        }

        if let Err(reason) = self.provision(&path) {
            self.registry().contexts.remove(invocation_id);
            tracing::error!(
                "[Worktree] Failed to provision {} for {}: {}",
                path.display(),
                step_name,
                reason
            );
            return Err(acquisition_err(reason));
        }

        let mut reg = self.registry();
        let ctx = reg
            .contexts
            .get_mut(invocation_id)
            .ok_or_else(|| ContextError::NotFound(invocation_id.to_string()))?;
        ctx.state = ContextState::Active;
        tracing::info!(
            "[Worktree] Acquired {} for {}/{}",
            ctx.path.display(),
            run_id,
            step_name
        );
        Ok(ctx.clone())
    }

    fn provision(&self, path: &Path) -> Result<(), String> {
        match self.provisioner {
            ProvisionerKind::Directory => std::fs::create_dir_all(path).map_err(|e| e.to_string()),
            ProvisionerKind::Git => {
                if !git::is_git_repo(&self.repo_root) {
                    return Err(format!("{} is not a git repository", self.repo_root.display()));
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                }
                git::worktree_add_detached(&self.repo_root, path)
            }
        }
    }

    /// Mark an active context as finished. Deletion is deferred to `sweep`.
    pub fn release(&self, id: &str, outcome: ContextOutcome) -> Result<ExecutionContext, ContextError> {
        let mut reg = self.registry();
        let ctx = reg
            .contexts
            .get_mut(id)
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
        if !matches!(ctx.state, ContextState::Active | ContextState::Created) {
            return Err(ContextError::InvalidState {
                id: id.to_string(),
                state: ctx.state,
                expected: "created or active",
            });
        }
        ctx.state = match outcome {
            ContextOutcome::Succeeded => ContextState::Completed,
            ContextOutcome::Failed => ContextState::Failed,
        };
        ctx.released_at = Some(Utc::now());
        tracing::debug!("[Worktree] Released {} as {:?}", id, ctx.state);
        Ok(ctx.clone())
    }

    /// Give up on a context without deleting it, keeping artifacts inspectable.
    pub fn abandon(&self, id: &str) -> Result<ExecutionContext, ContextError> {
        let mut reg = self.registry();
        let ctx = reg
            .contexts
            .get_mut(id)
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
        if matches!(ctx.state, ContextState::Created | ContextState::Active) {
            ctx.state = ContextState::Abandoned;
            ctx.released_at = Some(Utc::now());
            tracing::info!("[Worktree] Abandoned {} at {}", id, ctx.path.display());
        }
        Ok(ctx.clone())
    }

    /// Reference a context from an in-flight poll registration.
    pub fn pin(&self, id: &str) {
        *self.registry().pins.entry(id.to_string()).or_insert(0) += 1;
    }

    pub fn unpin(&self, id: &str) {
        let mut reg = self.registry();
        if let Some(count) = reg.pins.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                reg.pins.remove(id);
            }
        }
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.registry().is_pinned(id)
    }

    pub fn get(&self, id: &str) -> Option<ExecutionContext> {
        self.registry().contexts.get(id).cloned()
    }

    /// Register a context known from a persisted run (after a restart).
    pub fn adopt(&self, ctx: ExecutionContext) {
        self.registry()
            .contexts
            .entry(ctx.id.clone())
            .or_insert(ctx);
    }

    /// Released contexts older than `staleness`, eligible for cleanup.
    pub fn list(&self, staleness: Duration) -> Vec<ExecutionContext> {
        let cutoff = cutoff(staleness);
        let reg = self.registry();
        let mut stale: Vec<_> = reg
            .contexts
            .values()
            .filter(|c| c.state.is_released() && !reg.is_pinned(&c.id))
            .filter(|c| c.released_at.map(|t| t <= cutoff).unwrap_or(false))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.released_at.cmp(&b.released_at));
        stale
    }

    /// Delete completed/failed contexts past the retention window.
    ///
    /// Abandoned contexts are left for explicit `reclaim`.
    pub fn sweep(&self) -> Vec<String> {
        let candidates: Vec<String> = self
            .list(self.retention)
            .into_iter()
            .filter(|c| matches!(c.state, ContextState::Completed | ContextState::Failed))
            .map(|c| c.id)
            .collect();

        let mut reclaimed = Vec::new();
        for id in candidates {
            match self.reclaim(&id) {
                Ok(()) => reclaimed.push(id),
                Err(e) => tracing::warn!("[Worktree] Sweep skipped {}: {}", id, e),
            }
        }
        reclaimed
    }

    /// Delete a released context's directory now.
    pub fn reclaim(&self, id: &str) -> Result<(), ContextError> {
        let path = {
            let reg = self.registry();
            let ctx = reg
                .contexts
                .get(id)
                .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
            if reg.is_pinned(id) {
                return Err(ContextError::Pinned(id.to_string()));
            }
            if !ctx.state.is_released() {
                return Err(ContextError::InvalidState {
                    id: id.to_string(),
                    state: ctx.state,
                    expected: "completed, failed or abandoned",
                });
            }
            ctx.path.clone()
        };

        self.remove_dir(&path).map_err(|reason| ContextError::Removal {
            id: id.to_string(),
            reason,
        })?;

        if let Some(ctx) = self.registry().contexts.get_mut(id) {
            ctx.state = ContextState::Reclaimed;
        }
        tracing::info!("[Worktree] Reclaimed {} ({})", id, path.display());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<(), String> {
        if !path.exists() {
            return Ok(());
        }
        if self.provisioner == ProvisionerKind::Git {
            match git::worktree_remove(&self.repo_root, path) {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!(
                    "[Worktree] git worktree remove failed for {}, removing directory: {}",
                    path.display(),
                    e
                ),
            }
        }
        std::fs::remove_dir_all(path).map_err(|e| e.to_string())?;
        if self.provisioner == ProvisionerKind::Git && !git::worktree_prune(&self.repo_root) {
            tracing::warn!(
                "[Worktree] git worktree prune failed in {}",
                self.repo_root.display()
            );
        }
        Ok(())
    }
}

fn cutoff(staleness: Duration) -> DateTime<Utc> {
    let staleness = chrono::Duration::from_std(staleness)
        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    Utc::now()
        .checked_sub_signed(staleness)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
