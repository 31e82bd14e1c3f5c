//! Execution-mode resolution.
//!
//! Every step's mode is decided once, when a run starts, from (highest
//! precedence first):
//!
//! 1. the global `force_auto` flag
//! 2. the global `disable_delegation` flag
//! 3. workflow configuration (`step_modes` override, then `default_mode`)
//! 4. the step's own `mode`
//! 5. `Local`
//!
//! Steps without a `delegate` block always resolve to `Local`. The result is
//! stored on the run and never re-read from flags mid-run.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::workflow::schema::{Step, WorkflowConfig, WorkflowDefinition};

/// Where a step executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    DelegatedAuto,
    DelegatedManual,
}

impl ExecutionMode {
    pub fn is_delegated(&self) -> bool {
        !matches!(self, ExecutionMode::Local)
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Local => "local",
            ExecutionMode::DelegatedAuto => "delegated_auto",
            ExecutionMode::DelegatedManual => "delegated_manual",
        };
        write!(f, "{}", s)
    }
}

/// Global switches supplied by the caller when a run starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalFlags {
    /// Delegate every delegation-capable step without human gating.
    #[serde(default)]
    pub force_auto: bool,
    /// Run everything locally.
    #[serde(default)]
    pub disable_delegation: bool,
}

/// Which precedence tier decided a step's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSource {
    ForceAuto,
    DelegationDisabled,
    WorkflowStepOverride,
    WorkflowDefault,
    StepDefault,
    /// Delegate-only step with nothing configured: delegation is the only option.
    DelegateOnly,
    /// Step has no `delegate` block.
    NotDelegable,
    Fallback,
}

impl std::fmt::Display for ModeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModeSource::ForceAuto => "global force-auto flag",
            ModeSource::DelegationDisabled => "global disable-delegation flag",
            ModeSource::WorkflowStepOverride => "workflow step override",
            ModeSource::WorkflowDefault => "workflow default mode",
            ModeSource::StepDefault => "step default mode",
            ModeSource::DelegateOnly => "delegate-only step",
            ModeSource::NotDelegable => "step is not delegation-capable",
            ModeSource::Fallback => "fallback",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeResolution {
    pub mode: ExecutionMode,
    pub source: ModeSource,
}

impl ModeResolution {
    fn new(mode: ExecutionMode, source: ModeSource) -> Self {
        Self { mode, source }
    }
}

/// Resolve a single step's mode. Pure and total.
pub fn resolve(step: &Step, flags: &GlobalFlags, config: &WorkflowConfig) -> ModeResolution {
    if !step.can_delegate() {
        return ModeResolution::new(ExecutionMode::Local, ModeSource::NotDelegable);
    }
    if flags.force_auto {
        return ModeResolution::new(ExecutionMode::DelegatedAuto, ModeSource::ForceAuto);
    }
    if flags.disable_delegation {
        return ModeResolution::new(ExecutionMode::Local, ModeSource::DelegationDisabled);
    }
    if let Some(mode) = config.step_modes.get(&step.name) {
        return ModeResolution::new(*mode, ModeSource::WorkflowStepOverride);
    }
    if let Some(mode) = config.default_mode {
        return ModeResolution::new(mode, ModeSource::WorkflowDefault);
    }
    if let Some(mode) = step.mode {
        return ModeResolution::new(mode, ModeSource::StepDefault);
    }
    if !step.can_run_locally() {
        return ModeResolution::new(ExecutionMode::DelegatedAuto, ModeSource::DelegateOnly);
    }
    ModeResolution::new(ExecutionMode::Local, ModeSource::Fallback)
}

/// A step with its group position and resolved mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    pub group: usize,
    pub name: String,
    pub resolution: ModeResolution,
}

/// Validate a definition and resolve every step's mode for a new run.
///
/// Fails with `Configuration` when the definition is malformed or when a
/// step ends up `Local` without a local action to run.
pub fn resolve_workflow(
    definition: &WorkflowDefinition,
    flags: &GlobalFlags,
) -> Result<Vec<ResolvedStep>, EngineError> {
    definition.validate()?;

    let mut resolved = Vec::with_capacity(definition.step_count());
    for (group, step) in definition.iter_steps() {
        let resolution = resolve(step, flags, &definition.config);
        if resolution.mode == ExecutionMode::Local && !step.can_run_locally() {
            return Err(EngineError::Configuration(format!(
                "Step '{}' resolved to local execution ({}) but has no `run` action",
                step.name, resolution.source
            )));
        }
        tracing::info!(
            "[Mode] {}.{} → {} ({})",
            definition.name,
            step.name,
            resolution.mode,
            resolution.source
        );
        resolved.push(ResolvedStep {
            group,
            name: step.name.clone(),
            resolution,
        });
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::StepGroup;

    fn hybrid(name: &str) -> Step {
        let mut step = Step::delegated(name, "do_it");
        step.run = Step::local(name, "check").run;
        step
    }

    #[test]
    fn test_non_delegable_step_is_always_local() {
        let step = Step::local("lint", "clippy");
        let flags = GlobalFlags {
            force_auto: true,
            disable_delegation: false,
        };
        let r = resolve(&step, &flags, &WorkflowConfig::default());
        assert_eq!(r.mode, ExecutionMode::Local);
        assert_eq!(r.source, ModeSource::NotDelegable);
    }

    #[test]
    fn test_force_auto_overrides_manual_configuration() {
        let step = hybrid("x").with_mode(ExecutionMode::DelegatedManual);
        let mut config = WorkflowConfig {
            default_mode: Some(ExecutionMode::Local),
            ..Default::default()
        };
        config
            .step_modes
            .insert("x".to_string(), ExecutionMode::DelegatedManual);
        let flags = GlobalFlags {
            force_auto: true,
            disable_delegation: true,
        };

        let r = resolve(&step, &flags, &config);
        assert_eq!(r.mode, ExecutionMode::DelegatedAuto);
        assert_eq!(r.source, ModeSource::ForceAuto);
    }

    #[test]
    fn test_disable_delegation_beats_workflow_config() {
        let step = hybrid("x");
        let config = WorkflowConfig {
            default_mode: Some(ExecutionMode::DelegatedAuto),
            ..Default::default()
        };
        let flags = GlobalFlags {
            force_auto: false,
            disable_delegation: true,
        };
        let r = resolve(&step, &flags, &config);
        assert_eq!(r.mode, ExecutionMode::Local);
        assert_eq!(r.source, ModeSource::DelegationDisabled);
    }

    #[test]
    fn test_workflow_tier_precedence() {
        let step = hybrid("x").with_mode(ExecutionMode::Local);
        let flags = GlobalFlags::default();

        let mut config = WorkflowConfig {
            default_mode: Some(ExecutionMode::DelegatedAuto),
            ..Default::default()
        };
        let r = resolve(&step, &flags, &config);
        assert_eq!(r.mode, ExecutionMode::DelegatedAuto);
        assert_eq!(r.source, ModeSource::WorkflowDefault);

        config
            .step_modes
            .insert("x".to_string(), ExecutionMode::DelegatedManual);
        let r = resolve(&step, &flags, &config);
        assert_eq!(r.mode, ExecutionMode::DelegatedManual);
        assert_eq!(r.source, ModeSource::WorkflowStepOverride);
    }

    #[test]
    fn test_step_default_then_fallback() {
        let flags = GlobalFlags::default();
        let config = WorkflowConfig::default();

        let r = resolve(
            &hybrid("x").with_mode(ExecutionMode::DelegatedManual),
            &flags,
            &config,
        );
        assert_eq!(r.mode, ExecutionMode::DelegatedManual);
        assert_eq!(r.source, ModeSource::StepDefault);

        let r = resolve(&hybrid("x"), &flags, &config);
        assert_eq!(r.mode, ExecutionMode::Local);
        assert_eq!(r.source, ModeSource::Fallback);

        let r = resolve(&Step::delegated("pr", "open_pr"), &flags, &config);
        assert_eq!(r.mode, ExecutionMode::DelegatedAuto);
        assert_eq!(r.source, ModeSource::DelegateOnly);
    }

    #[test]
    fn test_resolve_workflow_rejects_local_without_action() {
        let wf = WorkflowDefinition::new(
            "wf",
            vec![StepGroup::Single(Step::delegated("pr", "open_pr"))],
        );
        let flags = GlobalFlags {
            force_auto: false,
            disable_delegation: true,
        };
        let err = resolve_workflow(&wf, &flags).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_resolve_workflow_is_deterministic() {
        let mut wf = WorkflowDefinition::new(
            "wf",
            vec![
                StepGroup::Single(Step::local("a", "x")),
                StepGroup::Parallel {
                    parallel: vec![hybrid("b"), Step::delegated("c", "y")],
                },
            ],
        );
        wf.config
            .step_modes
            .insert("b".to_string(), ExecutionMode::DelegatedManual);
        let flags = GlobalFlags::default();

        let first = resolve_workflow(&wf, &flags).unwrap();
        let second = resolve_workflow(&wf, &flags).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[1].group, 1);
        assert_eq!(first[1].resolution.mode, ExecutionMode::DelegatedManual);
        assert_eq!(first[2].resolution.mode, ExecutionMode::DelegatedAuto);
    }
}
