//! `${...}` substitution for delegate input templates.
//!
//! Supported patterns:
//! - `${run.id}`: the run identifier
//! - `${step.name}`: the step being delegated
//! - `${variables.<key>}` or `${<key>}`: from the workflow `variables` block
//! - `${ENV_VAR}`: from the environment
//!
//! Unknown references are left in place.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid reference regex"));

/// Values available while rendering one step's template.
pub struct TemplateContext<'a> {
    pub run_id: &'a str,
    pub step_name: &'a str,
    pub variables: &'a HashMap<String, String>,
}

impl TemplateContext<'_> {
    /// Substitute every reference in one pass; inserted values are not rescanned.
    pub fn render(&self, template: &str) -> String {
        REFERENCE_RE
            .replace_all(template, |caps: &Captures| {
                self.lookup(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "run.id" => Some(self.run_id.to_string()),
            "step.name" => Some(self.step_name.to_string()),
            _ => match key.strip_prefix("variables.") {
                Some(name) => self.variables.get(name).cloned(),
                None => self
                    .variables
                    .get(key)
                    .cloned()
                    .or_else(|| std::env::var(key).ok()),
            },
        }
    }
}
