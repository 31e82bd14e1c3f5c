//! Engine ↔ runtime round trip through the on-disk protocol files.

mod common;

use std::sync::Arc;
use std::time::Duration;

use baton_core::channel::file::FileCommandChannel;
use baton_core::channel::{CommandArtifact, StatusArtifact, StatusState};
use baton_core::run::{RunStatus, StepState};
use baton_core::workflow::{ExecutionMode, GlobalFlags, Step, StepGroup, WorkflowDefinition};
use baton_core::{Database, Engine};

use common::{test_config, wait_until, ScriptedExecutor};

#[tokio::test]
async fn test_runtime_answers_through_status_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(
        test_config(dir.path()),
        Database::open_in_memory().unwrap(),
        Arc::new(FileCommandChannel::new()),
        Arc::new(ScriptedExecutor::new()),
    );

    let mut step = Step::delegated("open-pr", "open_pr").with_mode(ExecutionMode::DelegatedAuto);
    if let Some(template) = step.delegate.as_mut() {
        template.input = Some("Open a PR for ${workflow} run ${run.id}".into());
    }
    let mut def = WorkflowDefinition::new("release", vec![StepGroup::Single(step)]);
    def.variables.insert("workflow".into(), "release".into());

    let run_id = engine.start_run(def, GlobalFlags::default()).await.unwrap();
    let running = wait_until(&engine, &run_id, |r| {
        r.step("open-pr").unwrap().context_id.is_some()
    })
    .await;

    let ctx_id = running.step("open-pr").unwrap().context_id.clone().unwrap();
    let ctx = running.context(&ctx_id).unwrap().clone();
    let command: CommandArtifact = serde_json::from_str(
        &std::fs::read_to_string(FileCommandChannel::command_path(&ctx)).unwrap(),
    )
    .unwrap();
    assert_eq!(command.run_id, run_id);
    assert_eq!(command.action, "open_pr");
    assert_eq!(
        command.input.as_deref(),
        Some(format!("Open a PR for release run {}", run_id).as_str())
    );

    // A half-written status is treated as not there yet.
    let status_path = FileCommandChannel::status_path(&ctx);
    std::fs::write(&status_path, r#"{"invocationId": "#).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        engine.get_run_status(&run_id).await.unwrap().step("open-pr").unwrap().state,
        StepState::Running
    );

    let mut status = StatusArtifact::new(command.invocation_id.clone(), StatusState::Succeeded);
    status.result = Some(serde_json::json!({ "pr": 42 }));
    std::fs::write(&status_path, serde_json::to_string(&status).unwrap()).unwrap();

    let run = engine.wait(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    let step = run.step("open-pr").unwrap();
    assert_eq!(step.result.as_ref().unwrap()["pr"], 42);

    // The command file is untouched by the status write.
    let again: CommandArtifact = serde_json::from_str(
        &std::fs::read_to_string(FileCommandChannel::command_path(&ctx)).unwrap(),
    )
    .unwrap();
    assert_eq!(again, command);
}
