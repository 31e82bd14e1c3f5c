//! YAML schema types for workflow definitions.
//!
//! A workflow YAML is an ordered list of step groups. A group is either a
//! single step or a `parallel` block whose steps run concurrently:
//!
//! ```yaml
//! name: "pre-merge"
//! description: "Quality gate before opening a PR"
//! version: "1.0"
//!
//! variables:
//!   base_branch: "main"
//!
//! config:
//!   default_mode: delegated_auto   # local | delegated_auto | delegated_manual
//!   step_modes:
//!     open-pr: delegated_manual
//!
//! steps:
//!   - name: lint
//!     run:
//!       check: clippy
//!
//!   - parallel:
//!       - name: unit-tests
//!         run:
//!           check: test
//!         delegate:
//!           action: run_tests
//!           input: "Run the unit tests on ${variables.base_branch}"
//!         timeout_secs: 900
//!       - name: docs
//!         run:
//!           check: doc
//!         on_failure: continue
//!
//!   - name: open-pr
//!     delegate:
//!       action: open_pr
//!       input: "Open a PR for run ${run.id}"
//! ```

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::MAX_WAIT_SECS;
use crate::error::EngineError;
use crate::workflow::mode::ExecutionMode;

/// Top-level workflow definition loaded from a YAML file.
///
/// Immutable once a run starts: the engine stores a copy of it in the run
/// snapshot and only ever reads that copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Variable substitution map for delegate input templates
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Workflow-level execution-mode configuration
    #[serde(default)]
    pub config: WorkflowConfig,

    /// Ordered step groups; groups run strictly in sequence
    pub steps: Vec<StepGroup>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Workflow-level configuration consulted by the mode resolver.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkflowConfig {
    /// Mode applied to every delegation-capable step
    #[serde(default)]
    pub default_mode: Option<ExecutionMode>,

    /// Per-step overrides, keyed by step name; win over `default_mode`
    #[serde(default)]
    pub step_modes: HashMap<String, ExecutionMode>,
}

/// A group of steps. Groups execute in order; steps inside a group may run
/// concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepGroup {
    Parallel { parallel: Vec<Step> },
    Single(Step),
}

impl StepGroup {
    pub fn steps(&self) -> &[Step] {
        match self {
            StepGroup::Parallel { parallel } => parallel,
            StepGroup::Single(step) => std::slice::from_ref(step),
        }
    }
}

/// What to do with the rest of the workflow when this step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Cancel every group after the current one (default)
    #[default]
    Stop,
    /// Keep going with the next group
    Continue,
}

/// A single step in the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within the workflow)
    pub name: String,

    /// Local action: a named check run by the orchestrating process
    #[serde(default)]
    pub run: Option<LocalAction>,

    /// Delegated command template. A step with one is delegation-capable.
    #[serde(default)]
    pub delegate: Option<DelegateTemplate>,

    /// Step-level default mode (lowest configured precedence)
    #[serde(default)]
    pub mode: Option<ExecutionMode>,

    /// Wait budget for a delegated invocation; falls back to the engine default
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub on_failure: OnFailure,
}

/// A named check executed locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalAction {
    /// Check name, e.g. "clippy" or "test"
    pub check: String,

    /// Inline shell command; when absent the executor looks the check up
    #[serde(default)]
    pub command: Option<String>,
}

/// Template for the command artifact sent to the external runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegateTemplate {
    /// Action name understood by the external runtime, e.g. "open_pr"
    pub action: String,

    /// Free-form instruction text; supports `${...}` substitution
    #[serde(default)]
    pub input: Option<String>,

    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl Step {
    /// A step that only runs locally.
    pub fn local(name: impl Into<String>, check: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: Some(LocalAction {
                check: check.into(),
                command: None,
            }),
            delegate: None,
            mode: None,
            timeout_secs: None,
            on_failure: OnFailure::Stop,
        }
    }

    /// A step that can only be delegated.
    pub fn delegated(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: None,
            delegate: Some(DelegateTemplate {
                action: action.into(),
                input: None,
                params: HashMap::new(),
            }),
            mode: None,
            timeout_secs: None,
            on_failure: OnFailure::Stop,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = OnFailure::Continue;
        self
    }

    pub fn can_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    pub fn can_run_locally(&self) -> bool {
        self.run.is_some()
    }
}

impl WorkflowDefinition {
    /// Build a definition from groups, mostly useful for embedding and tests.
    pub fn new(name: impl Into<String>, steps: Vec<StepGroup>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: default_version(),
            variables: HashMap::new(),
            config: WorkflowConfig::default(),
            steps,
        }
    }

    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml).map_err(|e| {
            EngineError::Configuration(format!("Failed to parse workflow YAML: {}", e))
        })
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// All steps with the index of the group they belong to.
    pub fn iter_steps(&self) -> impl Iterator<Item = (usize, &Step)> {
        self.steps
            .iter()
            .enumerate()
            .flat_map(|(i, g)| g.steps().iter().map(move |s| (i, s)))
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.iter_steps().map(|(_, s)| s).find(|s| s.name == name)
    }

    pub fn step_count(&self) -> usize {
        self.iter_steps().count()
    }

    /// Structural checks that do not depend on global flags.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Workflow '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for (i, group) in self.steps.iter().enumerate() {
            if group.steps().is_empty() {
                return Err(EngineError::Configuration(format!(
                    "Step group {} is an empty parallel block",
                    i + 1
                )));
            }
            for step in group.steps() {
                if step.name.trim().is_empty() {
                    return Err(EngineError::Configuration(format!(
                        "Step group {} contains a step without a name",
                        i + 1
                    )));
                }
                if !seen.insert(step.name.as_str()) {
                    return Err(EngineError::Configuration(format!(
                        "Duplicate step name '{}'",
                        step.name
                    )));
                }
                if step.timeout_secs.is_some_and(|t| t > MAX_WAIT_SECS) {
                    return Err(EngineError::Configuration(format!(
                        "Step '{}' asks for timeout_secs above the {}s maximum",
                        step.name, MAX_WAIT_SECS
                    )));
                }
                if !step.can_run_locally() && !step.can_delegate() {
                    return Err(EngineError::Configuration(format!(
                        "Step '{}' has neither a `run` nor a `delegate` block",
                        step.name
                    )));
                }
            }
        }

        for name in self.config.step_modes.keys() {
            if !seen.contains(name.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "config.step_modes references unknown step '{}'",
                    name
                )));
            }
        }

        Ok(())
    }
}
