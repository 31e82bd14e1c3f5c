//! The Baton engine: starts, drives, resumes and cancels workflow runs.
//!
//! Each active run is owned by one driver task (see [`driver`]); the
//! [`Engine`] handle talks to it over a control channel. Everything a
//! caller can observe comes from the run store, which the driver updates
//! after every step transition.

mod driver;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::channel::{CommandChannel, FileCommandChannel};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::executor::{LocalExecutor, ShellExecutor};
use crate::run::{RunFilter, RunSnapshot, WorkflowRun};
use crate::store::RunStore;
use crate::workflow::{resolve_workflow, GlobalFlags, WorkflowDefinition};
use crate::worktree::{ContextError, ExecutionContext, WorktreeManager};

use driver::{Control, RunDriver};

struct DriverHandle {
    /// Distinguishes a resumed driver from an aborted one for the same run
    generation: u64,
    control: mpsc::UnboundedSender<Control>,
    done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: RunStore,
    pub(crate) worktrees: WorktreeManager,
    pub(crate) channel: Arc<dyn CommandChannel>,
    pub(crate) executor: Arc<dyn LocalExecutor>,
    pub(crate) events: EventBus,
    drivers: Mutex<HashMap<String, DriverHandle>>,
    generations: AtomicU64,
}

impl EngineInner {
    fn drivers(&self) -> MutexGuard<'_, HashMap<String, DriverHandle>> {
        self.drivers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lives inside a driver task. However the task ends (finished, aborted
/// or panicked) the run stops counting as active and waiters wake up.
struct DriverGuard {
    inner: Arc<EngineInner>,
    run_id: String,
    generation: u64,
    done: watch::Sender<bool>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        {
            let mut drivers = self.inner.drivers();
            if drivers
                .get(&self.run_id)
                .is_some_and(|h| h.generation == self.generation)
            {
                drivers.remove(&self.run_id);
            }
        }
        let _ = self.done.send(true);
    }
}

/// Cheap to clone; clones share runs, store and worktrees.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        db: Database,
        channel: Arc<dyn CommandChannel>,
        executor: Arc<dyn LocalExecutor>,
    ) -> Self {
        let worktrees = WorktreeManager::new(
            config.worktree_root(),
            config.repo_root.clone(),
            config.provisioner,
            config.retention(),
        );
        Self {
            inner: Arc::new(EngineInner {
                store: RunStore::new(db),
                worktrees,
                channel,
                executor,
                events: EventBus::default(),
                drivers: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Engine over the on-disk store with the file protocol and shell checks.
    ///
    /// Contexts recorded by earlier processes are re-registered so that
    /// listing, sweeping and resuming see them.
    pub async fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let db = Database::open(config.db_path())?;
        let executor = ShellExecutor::new(config.repo_root.clone(), config.checks.clone());
        let engine = Self::new(config, db, Arc::new(FileCommandChannel::new()), Arc::new(executor));
        let adopted = engine.restore_contexts().await?;
        if adopted > 0 {
            tracing::info!("[Engine] Restored {} execution contexts", adopted);
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.inner.worktrees
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Register every context recorded in stored runs with the worktree manager.
    pub async fn restore_contexts(&self) -> Result<usize, EngineError> {
        let runs = self.inner.store.list(&RunFilter::default()).await?;
        let mut count = 0;
        for run in runs {
            for ctx in run.contexts {
                self.inner.worktrees.adopt(ctx);
                count += 1;
            }
        }
        Ok(count)
    }

    // ─── Run lifecycle ──────────────────────────────────────────────────

    /// Resolve modes, persist a new run and start driving it.
    pub async fn start_run(
        &self,
        definition: WorkflowDefinition,
        flags: GlobalFlags,
    ) -> Result<String, EngineError> {
        let resolved = resolve_workflow(&definition, &flags)?;
        let run = WorkflowRun::new(definition, flags, &resolved);
        self.inner.store.save(&run).await?;
        tracing::info!(
            "[Engine] Started run {} of '{}' ({} steps)",
            run.id,
            run.workflow_name,
            run.steps.len()
        );
        let id = run.id.clone();
        self.spawn_driver(run, false);
        Ok(id)
    }

    pub async fn get_run_status(&self, run_id: &str) -> Result<RunSnapshot, EngineError> {
        self.inner.store.get(run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSnapshot>, EngineError> {
        self.inner.store.list(filter).await
    }

    /// Whether a driver in this process currently owns the run.
    pub fn is_active(&self, run_id: &str) -> bool {
        self.inner.drivers().contains_key(run_id)
    }

    /// Release a delegated-manual step waiting in `AwaitingTrigger`.
    pub async fn trigger_step(&self, run_id: &str, step: &str) -> Result<(), EngineError> {
        let control = self.control_for(run_id);
        if let Some(control) = control {
            let (reply, rx) = oneshot::channel();
            let sent = control.send(Control::Trigger {
                step: step.to_string(),
                reply,
            });
            if sent.is_ok() {
                if let Ok(result) = rx.await {
                    return result;
                }
            }
        }

        let run = self.inner.store.get(run_id).await?;
        Err(EngineError::Conflict(format!(
            "run {} is {} and not active in this engine; resume it first",
            run_id, run.status
        )))
    }

    /// Stop a run. In-flight steps are cancelled and their contexts abandoned.
    pub async fn cancel_run(&self, run_id: &str) -> Result<RunSnapshot, EngineError> {
        let control = self.control_for(run_id);
        if let Some(control) = control {
            let (reply, rx) = oneshot::channel();
            if control.send(Control::Cancel { reply }).is_ok() {
                if let Ok(run) = rx.await {
                    return Ok(run);
                }
            }
        }
        self.cancel_offline(run_id).await
    }

    /// Cancel a run that no driver owns, e.g. one left behind by a crash.
    async fn cancel_offline(&self, run_id: &str) -> Result<RunSnapshot, EngineError> {
        let mut run = self.inner.store.get(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run {} already finished as {}",
                run_id, run.status
            )));
        }

        for ctx in &run.contexts {
            self.inner.worktrees.adopt(ctx.clone());
        }
        let in_flight = run.cancel_all();
        let to_abandon: Vec<String> = in_flight
            .iter()
            .filter_map(|name| run.step(name).and_then(|s| s.context_id.clone()))
            .collect();
        for id in to_abandon {
            match self.inner.worktrees.abandon(&id) {
                Ok(ctx) => run.upsert_context(ctx),
                Err(e) => tracing::warn!("[Engine] Could not abandon {}: {}", id, e),
            }
        }

        self.inner.store.save(&run).await?;
        tracing::info!("[Engine] Cancelled inactive run {}", run_id);
        self.inner.events.emit(EngineEvent::RunFinished {
            run_id: run.id.clone(),
            status: run.status,
        });
        Ok(run)
    }

    /// Continue a non-terminal run from its stored snapshot.
    pub async fn resume_run(&self, run_id: &str) -> Result<(), EngineError> {
        if self.is_active(run_id) {
            return Err(EngineError::Conflict(format!("run {} is already active", run_id)));
        }
        let run = self.inner.store.get(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run {} already finished as {}",
                run_id, run.status
            )));
        }
        tracing::info!(
            "[Engine] Resuming run {} at group {} (ready: {:?})",
            run_id,
            run.current_group,
            run.ready_steps()
        );
        self.spawn_driver(run, true);
        Ok(())
    }

    /// Wait until the run's driver exits, then return the stored snapshot.
    pub async fn wait(&self, run_id: &str) -> Result<RunSnapshot, EngineError> {
        let done = self.inner.drivers().get(run_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.inner.store.get(run_id).await
    }

    /// Stop every driver without touching stored state; runs stay resumable.
    pub fn shutdown(&self) {
        let handles: Vec<(String, DriverHandle)> = self.inner.drivers().drain().collect();
        for (run_id, handle) in handles {
            tracing::info!("[Engine] Detaching run {}", run_id);
            handle.task.abort();
        }
    }

    // ─── Worktrees ──────────────────────────────────────────────────────

    pub fn list_worktrees(&self, staleness: Duration) -> Vec<ExecutionContext> {
        self.inner.worktrees.list(staleness)
    }

    pub fn sweep_worktrees(&self) -> Vec<String> {
        self.inner.worktrees.sweep()
    }

    pub fn reclaim_worktree(&self, id: &str) -> Result<(), EngineError> {
        self.inner.worktrees.reclaim(id).map_err(|e| match e {
            ContextError::NotFound(id) => EngineError::NotFound(format!("context {}", id)),
            ContextError::Pinned(_) | ContextError::InvalidState { .. } => {
                EngineError::Conflict(e.to_string())
            }
            other => EngineError::Internal(other.to_string()),
        })
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn control_for(&self, run_id: &str) -> Option<mpsc::UnboundedSender<Control>> {
        self.inner.drivers().get(run_id).map(|h| h.control.clone())
    }

    fn spawn_driver(&self, run: WorkflowRun, resume: bool) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let run_id = run.id.clone();
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let driver = RunDriver::new(self.inner.clone(), run, control_rx);
        let guard = DriverGuard {
            inner: self.inner.clone(),
            run_id: run_id.clone(),
            generation,
            done: done_tx,
        };

        let mut drivers = self.inner.drivers();
        let task = tokio::spawn(async move {
            let _guard = guard;
            driver.drive(resume).await;
        });
        drivers.insert(
            run_id,
            DriverHandle {
                generation,
                control: control_tx,
                done: done_rx,
                task,
            },
        );
    }
}
