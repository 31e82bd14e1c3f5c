//! `baton worktrees` — inspect and clean up released execution contexts.

use std::time::Duration;

use baton_core::worktree::{ContextState, ExecutionContext};
use baton_core::Engine;

use super::truncate;

pub fn list(engine: &Engine, stale_secs: u64) -> Result<(), String> {
    let contexts = engine.list_worktrees(Duration::from_secs(stale_secs));
    if contexts.is_empty() {
        println!("No released worktrees.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:<20}  {:<20}  {}",
        "ID", "STATE", "STEP", "RELEASED", "PATH"
    );
    for ctx in &contexts {
        print_row(ctx);
    }
    Ok(())
}

pub fn sweep(engine: &Engine) -> Result<(), String> {
    let reclaimed = engine.sweep_worktrees();
    if reclaimed.is_empty() {
        println!("Nothing to sweep.");
    } else {
        println!("🧹 Reclaimed {} worktree(s)", reclaimed.len());
        for id in &reclaimed {
            println!("   {}", id);
        }
    }
    let abandoned = engine
        .list_worktrees(Duration::ZERO)
        .into_iter()
        .filter(|c| c.state == ContextState::Abandoned)
        .count();
    if abandoned > 0 {
        println!(
            "   {} abandoned worktree(s) kept; use `baton worktrees reclaim <id>` to delete them",
            abandoned
        );
    }
    Ok(())
}

pub fn reclaim(engine: &Engine, id: &str) -> Result<(), String> {
    engine.reclaim_worktree(id).map_err(|e| e.to_string())?;
    println!("Reclaimed worktree {}", id);
    Ok(())
}

fn print_row(ctx: &ExecutionContext) {
    let released = ctx
        .released_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{:<36}  {:<10}  {:<20}  {:<20}  {}",
        ctx.id,
        state_label(ctx.state),
        truncate(&ctx.step_name, 20),
        released,
        ctx.path.display(),
    );
}

fn state_label(state: ContextState) -> &'static str {
    match state {
        ContextState::Created => "created",
        ContextState::Active => "active",
        ContextState::Completed => "completed",
        ContextState::Failed => "failed",
        ContextState::Abandoned => "abandoned",
        ContextState::Reclaimed => "reclaimed",
    }
}
