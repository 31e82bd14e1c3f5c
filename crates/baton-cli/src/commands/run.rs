//! `baton run`, `status`, `runs`, `resume`, `cancel`.

use baton_core::run::{RunFilter, RunSnapshot, RunStatus, StepState};
use baton_core::workflow::{GlobalFlags, WorkflowDefinition};
use baton_core::{Engine, EngineEvent};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{print_json, styled_run_status, styled_step_state, truncate};

/// Start a workflow and follow it until it finishes or is detached.
pub async fn run(
    engine: &Engine,
    workflow_file: &str,
    flags: GlobalFlags,
    assume_yes: bool,
) -> Result<(), String> {
    let workflow = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    println!("📄 Loaded workflow: {} ({})", workflow.name, workflow_file);
    if flags.force_auto {
        println!("   force-auto: every delegation-capable step is delegated");
    } else if flags.disable_delegation {
        println!("   no-delegate: steps with a local action run locally");
    }

    let events = engine.subscribe();
    let run_id = engine
        .start_run(workflow, flags)
        .await
        .map_err(|e| e.to_string())?;
    println!("   Run ID: {}", run_id);
    println!();

    follow(engine, &run_id, events, assume_yes).await
}

/// Pick an unfinished run back up.
pub async fn resume(engine: &Engine, run_id: &str, assume_yes: bool) -> Result<(), String> {
    let events = engine.subscribe();
    engine.resume_run(run_id).await.map_err(|e| e.to_string())?;
    println!("▶ Resumed run {}", run_id);

    // Manual steps already waiting emit no new transition; prompt for them now.
    let snapshot = engine.get_run_status(run_id).await.map_err(|e| e.to_string())?;
    for step in snapshot
        .steps
        .iter()
        .filter(|s| s.state == StepState::AwaitingTrigger)
    {
        handle_manual_step(engine, run_id, &step.name, assume_yes).await?;
    }

    follow(engine, run_id, events, assume_yes).await
}

pub async fn cancel(engine: &Engine, run_id: &str) -> Result<(), String> {
    let run = engine.cancel_run(run_id).await.map_err(|e| e.to_string())?;
    println!("Cancelled run {}", run.id);
    if !run.cancelled_in_flight.is_empty() {
        println!("   In flight: {}", run.cancelled_in_flight.join(", "));
    }
    Ok(())
}

pub async fn status(engine: &Engine, run_id: &str, json: bool) -> Result<(), String> {
    let run = engine.get_run_status(run_id).await.map_err(|e| e.to_string())?;
    if json {
        let value = serde_json::to_value(&run).map_err(|e| e.to_string())?;
        print_json(&value);
        return Ok(());
    }
    print_run(&run);
    Ok(())
}

pub async fn list(
    engine: &Engine,
    workflow: Option<String>,
    status: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<(), String> {
    let status = match status {
        Some(s) => Some(RunStatus::from_str(s).ok_or_else(|| {
            format!(
                "Invalid status: {}. Use running, succeeded, failed or cancelled",
                s
            )
        })?),
        None => None,
    };
    let filter = RunFilter {
        workflow_name: workflow,
        status,
        limit: Some(limit),
    };
    let runs = engine.list_runs(&filter).await.map_err(|e| e.to_string())?;

    if json {
        let rows: Vec<serde_json::Value> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "workflowName": r.workflow_name,
                    "status": r.status,
                    "createdAt": r.created_at,
                    "finishedAt": r.finished_at,
                })
            })
            .collect();
        print_json(&serde_json::Value::Array(rows));
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<20}  {:<10}  {:<7}  {}",
        "ID", "WORKFLOW", "STATUS", "STEPS", "CREATED"
    );
    for run in &runs {
        let done = run.steps.iter().filter(|s| s.state.is_terminal()).count();
        println!(
            "{:<36}  {:<20}  {:<10}  {:<7}  {}",
            run.id,
            truncate(&run.workflow_name, 20),
            run.status,
            format!("{}/{}", done, run.steps.len()),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

/// Stream step transitions until the run's driver exits.
async fn follow(
    engine: &Engine,
    run_id: &str,
    mut events: broadcast::Receiver<EngineEvent>,
    assume_yes: bool,
) -> Result<(), String> {
    let waiter = engine.clone();
    let id = run_id.to_string();
    let mut done = tokio::spawn(async move { waiter.wait(&id).await });

    loop {
        tokio::select! {
            finished = &mut done => {
                let run = finished
                    .map_err(|e| e.to_string())?
                    .map_err(|e| e.to_string())?;
                println!();
                print_run(&run);
                return outcome(&run);
            }
            event = events.recv() => match event {
                Ok(EngineEvent::StepChanged { run_id: rid, step, mode, state }) if rid == run_id => {
                    println!("  {} {} ({})", styled_step_state(state), step, mode);
                    if state == StepState::AwaitingTrigger {
                        handle_manual_step(engine, run_id, &step, assume_yes).await?;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("[CLI] Missed {} engine events", n);
                }
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Interrupted; detaching. Resume with `baton resume {}`", run_id);
                engine.shutdown();
            }
        }
    }
}

async fn handle_manual_step(
    engine: &Engine,
    run_id: &str,
    step: &str,
    assume_yes: bool,
) -> Result<(), String> {
    if confirm_trigger(step, assume_yes).await {
        engine
            .trigger_step(run_id, step)
            .await
            .map_err(|e| e.to_string())
    } else {
        println!(
            "Leaving '{}' waiting. Resume with `baton resume {}` to trigger it later.",
            step, run_id
        );
        engine.shutdown();
        Ok(())
    }
}

async fn confirm_trigger(step: &str, assume_yes: bool) -> bool {
    if assume_yes {
        return true;
    }
    let prompt = format!("Step '{}' is waiting for a manual trigger. Delegate it now?", step);
    let answer = tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
    })
    .await;
    match answer {
        Ok(Ok(yes)) => yes,
        Ok(Err(e)) => {
            tracing::warn!("[CLI] Cannot prompt for '{}': {}", step, e);
            false
        }
        Err(e) => {
            tracing::warn!("[CLI] Prompt task failed: {}", e);
            false
        }
    }
}

fn outcome(run: &RunSnapshot) -> Result<(), String> {
    match run.status {
        RunStatus::Succeeded => {
            println!("\n🎉 Workflow completed successfully!");
            Ok(())
        }
        RunStatus::Running => {
            println!("\n⏸  Run {} is paused and can be resumed.", run.id);
            Ok(())
        }
        RunStatus::Cancelled => Err(format!("Run {} was cancelled", run.id)),
        RunStatus::Failed => {
            let failed: Vec<_> = run
                .steps
                .iter()
                .filter(|s| s.state == StepState::Failed)
                .map(|s| s.name.clone())
                .collect();
            Err(format!("Workflow failed. Failed steps: {}", failed.join(", ")))
        }
    }
}

fn print_run(run: &RunSnapshot) {
    println!("Run {} — {}", run.id, run.workflow_name);
    println!("   Status: {}", styled_run_status(run.status));
    println!("   Started: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = run.finished_at {
        println!("   Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    for step in &run.steps {
        println!(
            "  [{}] {} {:<20} {}",
            step.group + 1,
            styled_step_state(step.state),
            truncate(&step.name, 20),
            step.mode,
        );
        if let Some(err) = &step.error {
            println!("        ↳ {}", err);
        }
        if let Some(late) = step.late_status {
            println!("        ↳ late status ignored: {:?}", late);
        }
    }
    if !run.cancelled_in_flight.is_empty() {
        println!();
        println!("   Cancelled while in flight: {}", run.cancelled_in_flight.join(", "));
    }
}
