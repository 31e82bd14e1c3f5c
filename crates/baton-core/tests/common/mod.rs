//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::channel::{CommandChannel, InMemoryChannel, StatusState};
use baton_core::config::{EngineConfig, PollConfig, ProvisionerKind};
use baton_core::executor::{LocalExecutor, LocalOutcome};
use baton_core::workflow::LocalAction;
use baton_core::{Database, Engine, RunSnapshot};

/// Local executor whose checks succeed unless listed as failing.
#[derive(Default)]
pub struct ScriptedExecutor {
    failing: HashSet<String>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, check: &str) -> Self {
        self.failing.insert(check.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LocalExecutor for ScriptedExecutor {
    async fn run(&self, step: &str, action: &LocalAction) -> LocalOutcome {
        self.calls.lock().unwrap().push(step.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&action.check) {
            LocalOutcome::failed(format!("{} exited with 1", action.check))
        } else {
            LocalOutcome::succeeded(format!("{} ok", action.check))
        }
    }
}

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        state_dir: dir.join("state"),
        repo_root: dir.to_path_buf(),
        worktree_root: Some(dir.join("worktrees")),
        provisioner: ProvisionerKind::Directory,
        poll: PollConfig {
            initial_interval_ms: 10,
            max_interval_ms: 50,
            backoff_factor: 2.0,
            default_timeout_secs: 10,
        },
        retention_secs: 0,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub db: Database,
    pub channel: InMemoryChannel,
    pub executor: Arc<ScriptedExecutor>,
    pub engine: Engine,
}

impl Harness {
    pub fn new(executor: ScriptedExecutor) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        Self::with_config(dir, config, executor)
    }

    pub fn with_config(dir: tempfile::TempDir, config: EngineConfig, executor: ScriptedExecutor) -> Self {
        let db = Database::open_in_memory().unwrap();
        let channel = InMemoryChannel::new();
        let executor = Arc::new(executor);
        let engine = Engine::new(
            config,
            db.clone(),
            Arc::new(channel.clone()) as Arc<dyn CommandChannel>,
            executor.clone(),
        );
        Self {
            dir,
            db,
            channel,
            executor,
            engine,
        }
    }

    /// A second engine over the same store, channel and executor, as after a restart.
    pub fn restart(&self) -> Engine {
        Engine::new(
            test_config(self.dir.path()),
            self.db.clone(),
            Arc::new(self.channel.clone()),
            self.executor.clone(),
        )
    }

    /// Answer `step`'s command with `state` once it has been sent, after `delay`.
    pub fn respond_after(&self, step: &str, state: StatusState, delay: Duration) {
        let channel = self.channel.clone();
        let step = step.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            loop {
                if channel.respond_to_step(&step, state) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }
}

/// Poll the stored snapshot until `predicate` holds (or panic after 5s).
pub async fn wait_until<F>(engine: &Engine, run_id: &str, predicate: F) -> RunSnapshot
where
    F: Fn(&RunSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = engine.get_run_status(run_id).await.unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached; last snapshot: {:#?}", snapshot.steps);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
