//! Engine configuration.
//!
//! Loaded from `baton.yaml` when present; every field has a default so an
//! empty file (or no file at all) is a valid configuration.
//!
//! ```yaml
//! state_dir: .baton
//! repo_root: .
//! provisioner: git          # git | directory
//! retention_secs: 86400
//! poll:
//!   initial_interval_ms: 1000
//!   max_interval_ms: 30000
//!   backoff_factor: 2.0
//!   default_timeout_secs: 1800
//! checks:
//!   clippy: "cargo clippy --all-targets -- -D warnings"
//!   test: "cargo test"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the config file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "baton.yaml";

/// Longest wait budget a delegated step may ask for (one year).
pub const MAX_WAIT_SECS: u64 = 365 * 24 * 60 * 60;

/// Upper bound for `poll.max_interval_ms` (one hour).
pub const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How execution contexts are materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    /// `git worktree add --detach` off the repository HEAD
    #[default]
    Git,
    /// Plain empty directory; for non-git projects and tests
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the run database and default worktree root live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Repository the worktrees are created from; local checks run here
    #[serde(default = "default_repo_root")]
    pub repo_root: PathBuf,

    /// Overrides `<state_dir>/worktrees`
    #[serde(default)]
    pub worktree_root: Option<PathBuf>,

    #[serde(default)]
    pub provisioner: ProvisionerKind,

    #[serde(default)]
    pub poll: PollConfig,

    /// How long released contexts are kept before `sweep` deletes them
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Check name → shell command, used by the shell executor
    #[serde(default)]
    pub checks: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Wait budget for delegated steps that don't set `timeout_secs`
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_state_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if cwd.parent().is_none() {
        if let Some(home) = dirs::home_dir() {
            return home.join(".baton");
        }
    }
    cwd.join(".baton")
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            backoff_factor: default_backoff_factor(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Interval to wait after another `Pending` observation.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let max = self.max_interval();
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .map(|next| next.min(max))
            .unwrap_or(max)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            repo_root: default_repo_root(),
            worktree_root: None,
            provisioner: ProvisionerKind::default(),
            poll: PollConfig::default(),
            retention_secs: default_retention_secs(),
            checks: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at `state_dir`, everything else default.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Read `path` if given, else `baton.yaml` if it exists, else defaults.
    pub fn load_or_default(path: Option<&str>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(DEFAULT_CONFIG_FILE)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.initial_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll.initial_interval_ms must be greater than zero".into(),
            ));
        }
        if self.poll.max_interval_ms < self.poll.initial_interval_ms {
            return Err(ConfigError::Invalid(
                "poll.max_interval_ms must be >= poll.initial_interval_ms".into(),
            ));
        }
        if self.poll.max_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll.max_interval_ms must be at most {}",
                MAX_POLL_INTERVAL_MS
            )));
        }
        if !self.poll.backoff_factor.is_finite() || self.poll.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "poll.backoff_factor must be a finite number >= 1.0".into(),
            ));
        }
        if self.poll.default_timeout_secs > MAX_WAIT_SECS {
            return Err(ConfigError::Invalid(format!(
                "poll.default_timeout_secs must be at most {} (one year)",
                MAX_WAIT_SECS
            )));
        }
        Ok(())
    }

    pub fn worktree_root(&self) -> PathBuf {
        self.worktree_root
            .clone()
            .unwrap_or_else(|| self.state_dir.join("worktrees"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("baton.db")
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}
