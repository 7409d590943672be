use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::refine::DEFAULT_MAX_ATTEMPTS;
use crate::report::ReportKind;
use crate::sandbox::SandboxSpec;

pub(crate) const CONFIG_FILE: &str = "refinery.toml";

/// Environment override for `refine.max_attempts`.
pub(crate) const MAX_ATTEMPTS_ENV: &str = "REFINERY_MAX_ATTEMPTS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub refine: RefineConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub git: GitConfig,
}

/// Test runner container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Runner image; must contain the test tool
    #[serde(default = "default_image")]
    pub image: String,

    /// Test command, split with shell quoting rules. Test paths are appended.
    #[serde(default = "default_command")]
    pub command: String,

    /// Directory inside the container the files are copied into
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Memory limit (e.g., "1g", "512m")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "1", "0.5")
    #[serde(default = "default_cpus")]
    pub cpus: String,

    /// Maximum number of processes
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Wall-clock budget per test run
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Pull the image when it is not present locally
    #[serde(default = "default_true")]
    pub pull_missing: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: default_command(),
            workdir: default_workdir(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            timeout_secs: default_timeout_secs(),
            pull_missing: true,
        }
    }
}

/// What to do when the sandbox itself fails (daemon down, image missing)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxErrorPolicy {
    /// Treat it like a failing test run; it consumes an attempt
    Consume,
    /// Re-run the tests without consuming an attempt, up to `max_sandbox_retries`
    #[default]
    Retry,
    /// Stop the run immediately
    Abort,
}

/// Refinement loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Refactor attempts after the first failing test run. Zero never refines.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub sandbox_error_policy: SandboxErrorPolicy,

    /// Consecutive sandbox failures tolerated under the `retry` policy
    #[serde(default = "default_max_sandbox_retries")]
    pub max_sandbox_retries: u32,

    /// Delay before re-running after a sandbox failure
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sandbox_error_policy: SandboxErrorPolicy::default(),
            max_sandbox_retries: default_max_sandbox_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Output grammar of the test command: "pytest" or "tap"
    #[serde(default)]
    pub format: ReportKind,
}

/// External agent commands driving generation and refactoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command producing the initial code
    #[serde(default)]
    pub generate: Option<String>,

    /// Command fixing code after failing tests
    #[serde(default)]
    pub refactor: Option<String>,

    /// Per-invocation timeout
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            generate: None,
            refactor: None,
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

/// Versioning of generated code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Commit generated files once the tests pass
    #[serde(default)]
    pub commit_on_pass: bool,

    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            commit_on_pass: false,
            commit_message: default_commit_message(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "refinery-runner:latest".to_string()
}

fn default_command() -> String {
    "python -m pytest -rfE".to_string()
}

fn default_workdir() -> String {
    crate::sandbox::DEFAULT_WORKDIR.to_string()
}

fn default_memory() -> String {
    "1g".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_pids_limit() -> i64 {
    256
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_max_sandbox_retries() -> u32 {
    2
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_agent_timeout_secs() -> u64 {
    900
}

fn default_commit_message() -> String {
    "Add generated code passing tests".to_string()
}

impl Config {
    /// Load configuration from the project, then the user config dir,
    /// using defaults if neither exists. The result is validated.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config = match Self::config_path(project_dir) {
            Some(path) => Self::load_file(&path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn config_path(project_dir: &Path) -> Option<PathBuf> {
        let local = project_dir.join(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("refinery").join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    fn load_file(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    /// Rejects settings the sandbox or loop cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.sandbox.timeout_secs == 0 {
            bail!("sandbox.timeout_secs must be greater than zero");
        }
        if self.agent.timeout_secs == 0 {
            bail!("agent.timeout_secs must be greater than zero");
        }
        SandboxSpec::from_config(&self.sandbox, &[]).context("Invalid [sandbox] configuration")?;
        Ok(())
    }

    /// Applies `REFINERY_MAX_ATTEMPTS` if set.
    pub fn apply_env(&mut self) -> Result<()> {
        let value = std::env::var(MAX_ATTEMPTS_ENV).ok();
        self.apply_max_attempts_override(value.as_deref())
    }

    fn apply_max_attempts_override(&mut self, value: Option<&str>) -> Result<()> {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        self.refine.max_attempts = value
            .parse()
            .with_context(|| format!("{MAX_ATTEMPTS_ENV} must be a non-negative integer, got '{value}'"))?;
        Ok(())
    }
}
