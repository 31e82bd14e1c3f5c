//! Per-run control loop.
//!
//! A driver owns one [`WorkflowRun`] exclusively: it activates groups in
//! order, starts local work on a `JoinSet`, dispatches delegated steps
//! through the channel, and multiplexes local completions, control
//! messages and poll ticks in a single `select!`. The snapshot is saved
//! after every transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use super::EngineInner;
use crate::channel::{CommandArtifact, StatusArtifact, StatusState};
use crate::error::{EngineError, StepError, StepErrorKind};
use crate::events::EngineEvent;
use crate::executor::LocalOutcome;
use crate::poller::{PollEvent, PollRegistration, Poller};
use crate::run::{StepState, WorkflowRun};
use crate::workflow::{ExecutionMode, TemplateContext};
use crate::worktree::ContextOutcome;

/// Bytes of local output kept on a step record
const OUTPUT_TAIL_BYTES: usize = 16 * 1024;

pub(crate) enum Control {
    Trigger {
        step: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reply: oneshot::Sender<WorkflowRun>,
    },
}

enum Flow {
    Finished,
    Cancelled,
    /// Nothing left that can make progress in this process
    Detached,
}

pub(crate) struct RunDriver {
    inner: Arc<EngineInner>,
    run: WorkflowRun,
    poller: Poller,
    locals: JoinSet<(String, LocalOutcome)>,
    local_aborts: LocalAborts,
    control: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
}

impl RunDriver {
    pub(crate) fn new(
        inner: Arc<EngineInner>,
        run: WorkflowRun,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let poller = Poller::new(
            inner.config.poll.clone(),
            inner.channel.clone(),
            inner.worktrees.clone(),
        );
        Self {
            inner,
            run,
            poller,
            locals: JoinSet::new(),
            local_aborts: LocalAborts::default(),
            control,
            control_open: true,
        }
    }

    pub(crate) async fn drive(mut self, resume: bool) {
        if resume {
            self.reconcile().await;
        }
        match self.execute().await {
            Flow::Finished => self.finish().await,
            Flow::Cancelled => {}
            Flow::Detached => {
                tracing::warn!(
                    "[Engine] Run {} detached with steps awaiting trigger; resume it to continue",
                    self.run.id
                );
                self.poller.deregister_all();
            }
        }
    }

    async fn execute(&mut self) -> Flow {
        while self.run.current_group < self.run.group_count() {
            let group = self.run.current_group;

            let activated = self.run.activate_group(group);
            if !activated.is_empty() {
                tracing::info!(
                    "[Engine] Run {} group {}: {} ready",
                    self.run.id,
                    group,
                    activated.join(", ")
                );
                self.persist().await;
                for name in &activated {
                    self.emit_step(name);
                }
            }

            for name in self.run.group_step_names(group) {
                if self.state_of(&name) == Some(StepState::Ready) {
                    self.start_step(&name).await;
                }
            }

            while !self.run.group_is_terminal(group) {
                let wake = self.poller.next_wake();
                tokio::select! {
                    Some(joined) = self.locals.join_next(), if !self.locals.is_empty() => {
                        match joined {
                            Ok((name, outcome)) => self.on_local_finished(&name, outcome).await,
                            Err(e) => tracing::error!("[Engine] Local task failed to join: {}", e),
                        }
                    }
                    msg = self.control.recv(), if self.control_open => match msg {
                        Some(Control::Trigger { step, reply }) => {
                            let result = self.on_trigger(&step).await;
                            let _ = reply.send(result);
                        }
                        Some(Control::Cancel { reply }) => {
                            self.cancel().await;
                            let _ = reply.send(self.run.clone());
                            return Flow::Cancelled;
                        }
                        None => self.control_open = false,
                    },
                    _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                        for event in self.poller.poll_due(Instant::now()) {
                            self.on_poll_event(event).await;
                        }
                    }
                    else => return Flow::Detached,
                }
            }

            if self.run.group_blocks(group) {
                let cancelled = self.run.cancel_after(group);
                tracing::warn!(
                    "[Engine] Run {} stopping after group {}; cancelled {:?}",
                    self.run.id,
                    group,
                    cancelled
                );
                self.persist().await;
                for name in &cancelled {
                    self.emit_step(name);
                }
                break;
            }

            self.run.current_group += 1;
            self.persist().await;
        }
        Flow::Finished
    }

    // ─── Step start ─────────────────────────────────────────────────────

    async fn start_step(&mut self, name: &str) {
        let Some(mode) = self.run.step(name).map(|s| s.mode) else {
            return;
        };
        match mode {
            ExecutionMode::Local => self.start_local(name).await,
            ExecutionMode::DelegatedAuto => self.dispatch(name).await,
            ExecutionMode::DelegatedManual => {
                if self.transition(name, StepState::AwaitingTrigger) {
                    tracing::info!("[Engine] {} is waiting for a manual trigger", name);
                    self.persist().await;
                }
            }
        }
    }

    async fn start_local(&mut self, name: &str) {
        let Some(action) = self
            .run
            .definition
            .step(name)
            .and_then(|s| s.run.clone())
        else {
            // Rejected at resolution time; only reachable with a hand-edited snapshot.
            if self.transition(name, StepState::Running) {
                self.fail(name, StepError::new(StepErrorKind::LocalAction, "step has no local action"));
                self.persist().await;
            }
            return;
        };
        if !self.transition(name, StepState::Running) {
            return;
        }
        self.persist().await;

        let executor = self.inner.executor.clone();
        let step = name.to_string();
        let task = tokio::spawn(async move { executor.run(&step, &action).await });
        self.local_aborts.insert(name, task.abort_handle());

        let step = name.to_string();
        self.locals.spawn(async move {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => LocalOutcome::failed(format!("local action did not complete: {}", e)),
            };
            (step, outcome)
        });
    }

    /// Ready/AwaitingTrigger → Running for a delegated step.
    async fn dispatch(&mut self, name: &str) {
        let invocation_id = Uuid::new_v4().to_string();
        let command = match self.build_command(name, &invocation_id) {
            Ok(cmd) => cmd,
            Err(e) => {
                if self.transition(name, StepState::Running) {
                    self.fail(name, e);
                    self.persist().await;
                }
                return;
            }
        };

        if !self.transition(name, StepState::Running) {
            return;
        }
        if let Some(step) = self.run.step_mut(name) {
            step.invocation_id = Some(invocation_id.clone());
        }
        self.persist().await;

        let worktrees = self.inner.worktrees.clone();
        let (run_id, step_name, inv) = (self.run.id.clone(), name.to_string(), invocation_id.clone());
        let acquired = tokio::task::spawn_blocking(move || worktrees.acquire(&run_id, &step_name, &inv))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));

        let ctx = match acquired {
            Ok(ctx) => ctx,
            Err(reason) => {
                self.fail(name, StepError::new(StepErrorKind::ContextAcquisition, reason));
                self.persist().await;
                return;
            }
        };
        if let Some(step) = self.run.step_mut(name) {
            step.context_id = Some(ctx.id.clone());
        }
        self.run.upsert_context(ctx.clone());
        // Stored before the command goes out, so a resume finds the context
        // instead of dispatching the step a second time.
        self.persist().await;

        if let Err(e) = self.inner.channel.send(&ctx, command) {
            tracing::error!("[Engine] Failed to send command for {}: {}", name, e);
            self.release_context(&ctx.id, ContextOutcome::Failed);
            self.fail(name, StepError::new(StepErrorKind::ChannelWrite, e.to_string()));
            self.persist().await;
            return;
        }

        let timeout = self.step_timeout(name);
        self.poller.register(PollRegistration {
            step: name.to_string(),
            invocation_id,
            context: ctx,
            timeout,
        });
        self.persist().await;
    }

    fn build_command(&self, name: &str, invocation_id: &str) -> Result<CommandArtifact, StepError> {
        let template = self
            .run
            .definition
            .step(name)
            .and_then(|s| s.delegate.as_ref())
            .ok_or_else(|| StepError::new(StepErrorKind::ChannelWrite, "step has no delegate template"))?;

        let ctx = TemplateContext {
            run_id: &self.run.id,
            step_name: name,
            variables: &self.run.definition.variables,
        };
        let mut command = CommandArtifact::new(&self.run.id, name, invocation_id, &template.action);
        command.input = template.input.as_deref().map(|t| ctx.render(t));
        command.params = template
            .params
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => serde_json::Value::String(ctx.render(s)),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();
        Ok(command)
    }

    fn step_timeout(&self, name: &str) -> Duration {
        self.run
            .definition
            .step(name)
            .and_then(|s| s.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.inner.config.poll.default_timeout())
    }

    // ─── Completions ────────────────────────────────────────────────────

    async fn on_local_finished(&mut self, name: &str, outcome: LocalOutcome) {
        self.local_aborts.remove(name);
        if self.state_of(name) != Some(StepState::Running) {
            return;
        }
        let output = tail(&outcome.output, OUTPUT_TAIL_BYTES);
        if outcome.success {
            if self.transition(name, StepState::Succeeded) {
                if let Some(step) = self.run.step_mut(name) {
                    step.output = Some(output);
                }
            }
        } else {
            let error = StepError::new(StepErrorKind::LocalAction, format!("check for {} failed", name))
                .with_output(output);
            self.fail(name, error);
        }
        tracing::info!("[Engine] {} → {:?}", name, self.state_of(name));
        self.persist().await;
    }

    async fn on_trigger(&mut self, name: &str) -> Result<(), EngineError> {
        match self.state_of(name) {
            None => Err(EngineError::NotFound(format!("step {} in run {}", name, self.run.id))),
            Some(StepState::AwaitingTrigger) => {
                tracing::info!("[Engine] Triggered {}", name);
                self.dispatch(name).await;
                Ok(())
            }
            Some(state) => Err(EngineError::Conflict(format!(
                "step {} is {}, not awaiting a trigger",
                name, state
            ))),
        }
    }

    async fn on_poll_event(&mut self, event: PollEvent) {
        match event {
            PollEvent::Completed {
                step,
                invocation_id,
                status,
            } => {
                if !self.owns_invocation(&step, &invocation_id) {
                    return;
                }
                self.apply_status(&step, status);
            }
            PollEvent::TimedOut {
                step,
                invocation_id,
                waited,
            } => {
                if !self.owns_invocation(&step, &invocation_id) {
                    return;
                }
                if let Some(ctx_id) = self.context_of(&step) {
                    self.release_context(&ctx_id, ContextOutcome::Failed);
                }
                self.fail(
                    &step,
                    StepError::new(
                        StepErrorKind::PollTimeout,
                        format!("no terminal status after {}s", waited.as_secs()),
                    ),
                );
            }
            PollEvent::Late { step, status, .. } => {
                if let Some(record) = self.run.step_mut(&step) {
                    record.late_status = Some(status.state);
                }
            }
        }
        self.persist().await;
    }

    fn apply_status(&mut self, name: &str, status: StatusArtifact) {
        let outcome = match status.state {
            StatusState::Succeeded => ContextOutcome::Succeeded,
            _ => ContextOutcome::Failed,
        };
        if let Some(ctx_id) = self.context_of(name) {
            self.release_context(&ctx_id, outcome);
        }
        match status.state {
            StatusState::Succeeded => {
                if self.transition(name, StepState::Succeeded) {
                    if let Some(step) = self.run.step_mut(name) {
                        step.result = status.result;
                    }
                }
            }
            _ => {
                let message = status
                    .error
                    .clone()
                    .unwrap_or_else(|| "external runtime reported failure".to_string());
                self.fail(name, StepError::new(StepErrorKind::DelegatedAction, message));
                if let Some(step) = self.run.step_mut(name) {
                    step.result = status.result;
                }
            }
        }
    }

    // ─── Cancel / finish / resume ───────────────────────────────────────

    async fn cancel(&mut self) {
        self.poller.deregister_all();
        self.local_aborts.abort_all();
        self.locals.abort_all();

        let in_flight = self.run.cancel_all();
        for name in &in_flight {
            if let Some(ctx_id) = self.context_of(name) {
                match self.inner.worktrees.abandon(&ctx_id) {
                    Ok(ctx) => self.run.upsert_context(ctx),
                    Err(e) => tracing::warn!("[Engine] Could not abandon {}: {}", ctx_id, e),
                }
            }
        }
        tracing::info!(
            "[Engine] Cancelled run {} (in flight: {:?})",
            self.run.id,
            in_flight
        );
        self.persist().await;
        for step in self.run.steps.clone() {
            self.emit_step(&step.name);
        }
        self.inner.events.emit(EngineEvent::RunFinished {
            run_id: self.run.id.clone(),
            status: self.run.status,
        });
    }

    async fn finish(&mut self) {
        self.poller.deregister_all();
        let status = self.run.finish();
        tracing::info!("[Engine] Run {} finished: {}", self.run.id, status);
        self.persist().await;
        self.inner.events.emit(EngineEvent::RunFinished {
            run_id: self.run.id.clone(),
            status,
        });
    }

    /// Rebuild in-process state for a run loaded from the store.
    async fn reconcile(&mut self) {
        for ctx in &self.run.contexts {
            self.inner.worktrees.adopt(ctx.clone());
        }

        let group = self.run.current_group;
        for name in self.run.group_step_names(group) {
            let Some(record) = self.run.step(&name).cloned() else {
                continue;
            };
            if record.state != StepState::Running {
                continue;
            }

            let live_context = record
                .context_id
                .as_deref()
                .and_then(|id| self.inner.worktrees.get(id))
                .filter(|ctx| ctx.is_active());

            match (record.mode, record.invocation_id, live_context) {
                (ExecutionMode::Local, _, _) => {
                    tracing::info!("[Engine] Re-queueing interrupted local step {}", name);
                    self.transition(&name, StepState::Ready);
                }
                (_, Some(invocation_id), Some(ctx)) => {
                    let elapsed = record
                        .started_at
                        .and_then(|t| (Utc::now() - t).to_std().ok())
                        .unwrap_or_default();
                    let remaining = self.step_timeout(&name).saturating_sub(elapsed);
                    tracing::info!(
                        "[Engine] Re-attaching {} to invocation {} ({:?} left)",
                        name,
                        invocation_id,
                        remaining
                    );
                    self.poller.register(PollRegistration {
                        step: name.clone(),
                        invocation_id,
                        context: ctx,
                        timeout: remaining,
                    });
                }
                _ => {
                    // No live context, so no command can be pending for this invocation
                    tracing::info!("[Engine] Re-dispatching {} (no live context)", name);
                    self.transition(&name, StepState::Ready);
                }
            }
        }
        self.persist().await;
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    fn state_of(&self, name: &str) -> Option<StepState> {
        self.run.step(name).map(|s| s.state)
    }

    fn context_of(&self, name: &str) -> Option<String> {
        self.run.step(name).and_then(|s| s.context_id.clone())
    }

    fn owns_invocation(&self, name: &str, invocation_id: &str) -> bool {
        self.run
            .step(name)
            .map(|s| s.state == StepState::Running && s.invocation_id.as_deref() == Some(invocation_id))
            .unwrap_or(false)
    }

    fn transition(&mut self, name: &str, to: StepState) -> bool {
        match self.run.transition(name, to) {
            Ok(_) => {
                self.emit_step(name);
                true
            }
            Err(e) => {
                tracing::error!("[Engine] Run {}: {}", self.run.id, e);
                false
            }
        }
    }

    fn fail(&mut self, name: &str, error: StepError) {
        tracing::warn!("[Engine] {} failed: {}", name, error);
        match self.run.fail_step(name, error) {
            Ok(()) => self.emit_step(name),
            Err(e) => tracing::error!("[Engine] Run {}: {}", self.run.id, e),
        }
    }

    fn release_context(&mut self, id: &str, outcome: ContextOutcome) {
        match self.inner.worktrees.release(id, outcome) {
            Ok(ctx) => self.run.upsert_context(ctx),
            Err(e) => tracing::warn!("[Engine] Could not release context {}: {}", id, e),
        }
    }

    fn emit_step(&self, name: &str) {
        if let Some(step) = self.run.step(name) {
            self.inner.events.emit(EngineEvent::StepChanged {
                run_id: self.run.id.clone(),
                step: step.name.clone(),
                mode: step.mode,
                state: step.state,
            });
        }
    }

    async fn persist(&mut self) {
        self.run.updated_at = Utc::now();
        if let Err(e) = self.inner.store.save(&self.run).await {
            tracing::error!("[Engine] Failed to persist run {}: {}", self.run.id, e);
        }
    }
}

/// Abort handles of spawned local checks. Dropping the driver, including
/// by aborting its task, stops the checks too.
#[derive(Default)]
struct LocalAborts(HashMap<String, AbortHandle>);

impl LocalAborts {
    fn insert(&mut self, step: &str, handle: AbortHandle) {
        self.0.insert(step.to_string(), handle);
    }

    fn remove(&mut self, step: &str) {
        self.0.remove(step);
    }

    fn abort_all(&mut self) {
        for (_, handle) in self.0.drain() {
            handle.abort();
        }
    }
}

impl Drop for LocalAborts {
    fn drop(&mut self) {
        self.abort_all();
    }
}

fn tail(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_string()
}
