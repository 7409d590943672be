//! Execution request and result types for the sandbox.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::SandboxConfig;

/// Container path the snapshot is materialized into by default.
pub(crate) const DEFAULT_WORKDIR: &str = "/workspace";

/// CPU, memory and process limits for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct ResourceLimits {
    /// Hard memory limit in bytes (swap is capped to the same value).
    pub memory_bytes: i64,
    /// CPU quota in units of 10^-9 CPUs.
    pub nano_cpus: i64,
    /// Maximum number of processes.
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            pids_limit: 256,
        }
    }
}

impl ResourceLimits {
    /// Builds limits from config strings such as `"512m"` and `"1.5"`.
    pub fn parse(memory: &str, cpus: &str, pids_limit: i64) -> Result<Self> {
        let memory_bytes = parse_memory_limit(memory)?;
        let cpus: f64 = cpus
            .trim()
            .parse()
            .with_context(|| format!("Invalid CPU limit: {cpus}"))?;
        if !cpus.is_finite() || cpus <= 0.0 {
            bail!("CPU limit must be positive: {cpus}");
        }
        if pids_limit <= 0 {
            bail!("pids_limit must be positive: {pids_limit}");
        }
        // Rounded CPU fraction always fits comfortably in i64.
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0).round() as i64;
        Ok(Self {
            memory_bytes,
            nano_cpus,
            pids_limit,
        })
    }
}

/// Configuration for a single sandboxed execution.
///
/// Network access is not configurable: every execution runs with
/// networking disabled and there is no way to ask otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SandboxSpec {
    image: String,
    command: Vec<String>,
    workdir: String,
    limits: ResourceLimits,
    timeout: Duration,
}

impl SandboxSpec {
    /// Creates a spec with default workdir and limits.
    pub fn new(image: impl Into<String>, command: Vec<String>, timeout: Duration) -> Result<Self> {
        let image = image.into();
        if image.trim().is_empty() {
            bail!("Sandbox image cannot be empty");
        }
        if command.is_empty() || command[0].trim().is_empty() {
            bail!("Sandbox command cannot be empty");
        }
        if timeout.is_zero() {
            bail!("Sandbox timeout must be greater than zero");
        }
        Ok(Self {
            image,
            command,
            workdir: DEFAULT_WORKDIR.to_string(),
            limits: ResourceLimits::default(),
            timeout,
        })
    }

    /// Builds a spec from config, appending `extra_args` to the command.
    pub fn from_config(config: &SandboxConfig, extra_args: &[String]) -> Result<Self> {
        let mut command = shell_words::split(&config.command)
            .with_context(|| format!("Failed to parse sandbox command: {}", config.command))?;
        command.extend(extra_args.iter().cloned());

        let limits = ResourceLimits::parse(&config.memory, &config.cpus, config.pids_limit)?;

        Self::new(
            config.image.clone(),
            command,
            Duration::from_secs(config.timeout_secs),
        )?
        .with_workdir(config.workdir.clone())
        .map(|spec| spec.with_limits(limits))
    }

    /// Sets the container working directory (absolute, not `/`).
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Result<Self> {
        let workdir = workdir.into();
        let trimmed = workdir.trim_end_matches('/');
        if !workdir.starts_with('/') || trimmed.is_empty() || workdir.contains("..") {
            bail!("Sandbox workdir must be an absolute path below /: {workdir}");
        }
        self.workdir = trimmed.to_string();
        Ok(self)
    }

    /// Sets resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Runner image reference.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Argument vector executed as the container entrypoint.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Working directory inside the container.
    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    /// Resource limits.
    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Wall-clock budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Always true.
    #[allow(clippy::unused_self)]
    pub fn network_disabled(&self) -> bool {
        true
    }
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SandboxStatus {
    /// The command ran to completion (any exit code).
    Completed,
    /// The wall-clock budget ran out and the container was killed.
    TimedOut,
    /// The caller aborted the run and the container was killed.
    Cancelled,
    /// The container runtime failed before or during the run.
    SandboxError,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed-out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SandboxError => write!(f, "sandbox-error"),
        }
    }
}

/// Raw outcome of one execution. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SandboxResult {
    pub status: SandboxStatus,
    /// Exit code of the command; `None` if it never finished on its own.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Runtime diagnostic for `SandboxError` results.
    pub diagnostic: Option<String>,
}

impl SandboxResult {
    /// A command that exited on its own.
    pub fn completed(exit_code: i64, stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            status: SandboxStatus::Completed,
            exit_code: Some(exit_code),
            stdout,
            stderr,
            duration,
            diagnostic: None,
        }
    }

    /// A command killed at the timeout, with whatever output it produced.
    pub fn timed_out(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            status: SandboxStatus::TimedOut,
            exit_code: None,
            stdout,
            stderr,
            duration,
            diagnostic: None,
        }
    }

    /// A command killed on caller request.
    pub fn cancelled(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            status: SandboxStatus::Cancelled,
            exit_code: None,
            stdout,
            stderr,
            duration,
            diagnostic: None,
        }
    }

    /// An infrastructure failure.
    pub fn sandbox_error(diagnostic: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: SandboxStatus::SandboxError,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    let (num, unit) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };
    let count: i64 = num.parse().context("Invalid memory limit")?;
    let Some(bytes) = count.checked_mul(unit) else {
        bail!("Memory limit too large: {limit}");
    };

    // Docker refuses anything below 6 MiB.
    if bytes < 6 * 1024 * 1024 {
        bail!("Memory limit too small: {limit}");
    }
    Ok(bytes)
}
