//! `baton validate` — check a workflow file without running it.

use baton_core::workflow::{resolve_workflow, GlobalFlags, WorkflowDefinition};

use super::truncate;

/// Validate a workflow file and print each step's resolved mode.
pub fn validate(workflow_file: &str, flags: GlobalFlags) -> Result<(), String> {
    let workflow = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    let resolved = resolve_workflow(&workflow, &flags).map_err(|e| e.to_string())?;

    println!("✅ Workflow '{}' is valid", workflow.name);
    println!("   Version: {}", workflow.version);
    if let Some(desc) = &workflow.description {
        println!("   Description: {}", desc);
    }
    println!(
        "   {} step(s) in {} group(s)",
        resolved.len(),
        workflow.steps.len()
    );
    println!();
    println!("┌───────┬──────────────────────┬──────────────────┬────────────────────────────────┐");
    println!("│ Group │ Step                 │ Mode             │ Decided by                     │");
    println!("├───────┼──────────────────────┼──────────────────┼────────────────────────────────┤");
    for step in &resolved {
        println!(
            "│ {:<5} │ {:<20} │ {:<16} │ {:<30} │",
            step.group + 1,
            truncate(&step.name, 20),
            step.resolution.mode.to_string(),
            step.resolution.source.to_string(),
        );
    }
    println!("└───────┴──────────────────────┴──────────────────┴────────────────────────────────┘");
    Ok(())
}
