//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! baton-core [`Engine`].

pub mod run;
pub mod workflow;
pub mod worktree;

use baton_core::config::EngineConfig;
use baton_core::run::{RunStatus, StepState};
use baton_core::Engine;
use console::style;

/// Load the engine config and open the engine over its state directory.
pub async fn init_engine(config_path: Option<&str>, state_dir: Option<&str>) -> Result<Engine, String> {
    let mut config = EngineConfig::load_or_default(config_path).map_err(|e| e.to_string())?;
    if let Some(dir) = state_dir {
        config.state_dir = dir.into();
    }
    Engine::open(config).await.map_err(|e| e.to_string())
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub fn styled_step_state(state: StepState) -> String {
    let label = format!("{:<16}", state.to_string());
    match state {
        StepState::Succeeded => style(label).green().to_string(),
        StepState::Failed => style(label).red().to_string(),
        StepState::Cancelled => style(label).dim().to_string(),
        StepState::AwaitingTrigger => style(label).yellow().to_string(),
        StepState::Running => style(label).cyan().to_string(),
        _ => label,
    }
}

pub fn styled_run_status(status: RunStatus) -> String {
    match status {
        RunStatus::Succeeded => style(status).green().bold().to_string(),
        RunStatus::Failed => style(status).red().bold().to_string(),
        RunStatus::Cancelled => style(status).yellow().to_string(),
        RunStatus::Running => style(status).cyan().to_string(),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}
