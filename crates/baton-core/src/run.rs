//! Workflow runs and their step records.
//!
//! A [`WorkflowRun`] is the unit of persistence: the store writes the whole
//! snapshot after every step transition, and resumption rebuilds the
//! scheduler from it alone. All state-machine rules live here so they can
//! be exercised without an async runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::StatusState;
use crate::error::{EngineError, StepError};
use crate::workflow::{ExecutionMode, GlobalFlags, ModeSource, OnFailure, WorkflowDefinition};
use crate::workflow::mode::ResolvedStep;
use crate::worktree::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    /// Delegated-manual step waiting for an explicit trigger
    AwaitingTrigger,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Cancelled
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepState::Running | StepState::AwaitingTrigger)
    }

    fn can_transition_to(&self, to: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, AwaitingTrigger)
                | (Ready, Cancelled)
                | (AwaitingTrigger, Running)
                | (AwaitingTrigger, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                // Interrupted local work is re-queued on resume
                | (Running, Ready)
        )
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Ready => "ready",
            StepState::AwaitingTrigger => "awaiting_trigger",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "cancelled" | "canceled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub name: String,
    pub group: usize,
    /// Fixed at run start; never changes afterwards.
    pub mode: ExecutionMode,
    pub mode_source: ModeSource,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Terminal status that arrived after the step had already timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_status: Option<StatusState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn from_resolved(resolved: &ResolvedStep) -> Self {
        Self {
            name: resolved.name.clone(),
            group: resolved.group,
            mode: resolved.resolution.mode,
            mode_source: resolved.resolution.source,
            state: StepState::Pending,
            invocation_id: None,
            context_id: None,
            error: None,
            output: None,
            result: None,
            late_status: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Filter for listing stored runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Complete, self-contained state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_name: String,
    pub definition: WorkflowDefinition,
    pub flags: GlobalFlags,
    pub status: RunStatus,
    /// Index of the step group currently executing
    pub current_group: usize,
    pub steps: Vec<StepRecord>,
    /// Every context acquired for this run, in acquisition order
    #[serde(default)]
    pub contexts: Vec<ExecutionContext>,
    /// Steps that were running or awaiting a trigger when the run was cancelled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled_in_flight: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Snapshot returned by status queries.
pub type RunSnapshot = WorkflowRun;

impl WorkflowRun {
    pub fn new(definition: WorkflowDefinition, flags: GlobalFlags, resolved: &[ResolvedStep]) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_name: definition.name.clone(),
            definition,
            flags,
            status: RunStatus::Running,
            current_group: 0,
            steps: resolved.iter().map(StepRecord::from_resolved).collect(),
            contexts: Vec::new(),
            cancelled_in_flight: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn group_count(&self) -> usize {
        self.definition.steps.len()
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Names of the steps in `group`, in definition order.
    pub fn group_step_names(&self, group: usize) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.group == group)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Move a step along the state machine, stamping timestamps.
    pub fn transition(&mut self, name: &str, to: StepState) -> Result<StepState, EngineError> {
        let step = self
            .step_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("step {}", name)))?;
        let from = step.state;
        if !from.can_transition_to(to) {
            return Err(EngineError::Conflict(format!(
                "step {} cannot go from {} to {}",
                name, from, to
            )));
        }
        step.state = to;
        match to {
            StepState::Running => step.started_at = Some(Utc::now()),
            StepState::Ready => {
                step.started_at = None;
                step.invocation_id = None;
                step.context_id = None;
            }
            s if s.is_terminal() => step.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.updated_at = Utc::now();
        Ok(from)
    }

    /// Mark a running step failed with a diagnostic.
    pub fn fail_step(&mut self, name: &str, error: StepError) -> Result<(), EngineError> {
        self.transition(name, StepState::Failed)?;
        if let Some(step) = self.step_mut(name) {
            step.error = Some(error);
        }
        Ok(())
    }

    /// Promote every pending step of `group` to Ready at once.
    pub fn activate_group(&mut self, group: usize) -> Vec<String> {
        let names: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.group == group && s.state == StepState::Pending)
            .map(|s| s.name.clone())
            .collect();
        for name in &names {
            let _ = self.transition(name, StepState::Ready);
        }
        names
    }

    pub fn group_is_terminal(&self, group: usize) -> bool {
        self.steps
            .iter()
            .filter(|s| s.group == group)
            .all(|s| s.state.is_terminal())
    }

    /// True when a failed step in `group` stops the rest of the workflow.
    pub fn group_blocks(&self, group: usize) -> bool {
        self.steps
            .iter()
            .filter(|s| s.group == group && s.state == StepState::Failed)
            .any(|s| {
                self.definition
                    .step(&s.name)
                    .map(|d| d.on_failure == OnFailure::Stop)
                    .unwrap_or(true)
            })
    }

    /// Cancel every step in groups after `group` that has not started.
    pub fn cancel_after(&mut self, group: usize) -> Vec<String> {
        let names: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.group > group && s.state == StepState::Pending)
            .map(|s| s.name.clone())
            .collect();
        for name in &names {
            let _ = self.transition(name, StepState::Cancelled);
        }
        names
    }

    /// Steps currently Ready. Derived purely from the snapshot.
    pub fn ready_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Ready)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn in_flight_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.state.is_in_flight())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Record (or refresh) a context in the snapshot.
    pub fn upsert_context(&mut self, ctx: ExecutionContext) {
        match self.contexts.iter_mut().find(|c| c.id == ctx.id) {
            Some(existing) => *existing = ctx,
            None => self.contexts.push(ctx),
        }
        self.updated_at = Utc::now();
    }

    pub fn context(&self, id: &str) -> Option<&ExecutionContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    /// Cancel everything that has not finished. Returns the steps that were in flight.
    pub fn cancel_all(&mut self) -> Vec<String> {
        let in_flight = self.in_flight_steps();
        let open: Vec<String> = self
            .steps
            .iter()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.name.clone())
            .collect();
        for name in &open {
            let _ = self.transition(name, StepState::Cancelled);
        }
        self.cancelled_in_flight = in_flight.clone();
        self.status = RunStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        in_flight
    }

    /// Final status once every group has settled.
    ///
    /// Any failed step fails the run, including steps marked `continue`.
    pub fn compute_status(&self) -> RunStatus {
        if self.status == RunStatus::Cancelled {
            RunStatus::Cancelled
        } else if self.steps.iter().any(|s| s.state == StepState::Failed) {
            RunStatus::Failed
        } else if self.steps.iter().all(|s| s.state == StepState::Succeeded) {
            RunStatus::Succeeded
        } else if self.steps.iter().all(|s| s.state.is_terminal()) {
            RunStatus::Cancelled
        } else {
            RunStatus::Running
        }
    }

    pub fn finish(&mut self) -> RunStatus {
        self.status = self.compute_status();
        if self.status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
        self.updated_at = Utc::now();
        self.status
    }
}
