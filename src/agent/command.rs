//! External agent process
//!
//! Runs the configured command in the project root, writes the request to
//! stdin and reads the answer from stdout:
//!
//! ```text
//! stdin:  {"stage": "generate", "state": {...}}
//! stdout: {"files": [{"path": "...", "content": "...", "overwrite": true}], "state": {...}}
//! ```
//!
//! Anything the process prints before the final JSON line is ignored.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{AgentOutput, AgentProvider, Stage};
use crate::session::SessionState;

#[derive(Serialize)]
struct Request<'a> {
    stage: Stage,
    state: &'a SessionState,
}

/// Agent backed by an external command
pub(crate) struct CommandProvider {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(command: impl Into<String>, project_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.into(),
            timeout,
        }
    }

    async fn run(&self, program: &str, args: &[String], request: &[u8]) -> Result<std::process::Output> {
        let mut child = tokio::process::Command::new(program)
            .current_dir(&self.project_dir)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run agent command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that ignores its input may exit before reading it.
            match stdin.write_all(request).await {
                Ok(()) => stdin.flush().await.or_else(ignore_broken_pipe)?,
                Err(e) => ignore_broken_pipe(e)?,
            }
        }

        Ok(child.wait_with_output().await?)
    }
}

fn ignore_broken_pipe(err: std::io::Error) -> std::io::Result<()> {
    if err.kind() == ErrorKind::BrokenPipe {
        Ok(())
    } else {
        Err(err)
    }
}

#[async_trait]
impl AgentProvider for CommandProvider {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn invoke(&self, stage: Stage, state: &SessionState) -> Result<AgentOutput> {
        let parts = shell_words::split(&self.command)
            .with_context(|| format!("Failed to parse agent command: {}", self.command))?;
        let (program, args) = parts
            .split_first()
            .context("Agent command cannot be empty")?;

        info!(stage = %stage, command = %self.command, "Running agent");
        let request = serde_json::to_vec(&Request { stage, state })
            .context("Failed to serialize agent request")?;

        let output = tokio::time::timeout(self.timeout, self.run(program, args, &request))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Agent command timed out after {} seconds",
                    self.timeout.as_secs()
                )
            })??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Agent stderr: {}", stderr);
            bail!(
                "Agent command failed with exit code {:?}:\n{}",
                output.status.code(),
                stderr
            );
        }

        debug!("Agent output length: {} bytes", stdout.len());
        parse_output(&stdout)
    }
}

/// Parses the whole of stdout as JSON, else its last non-empty line.
fn parse_output(stdout: &str) -> Result<AgentOutput> {
    if let Ok(output) = serde_json::from_str(stdout) {
        return Ok(output);
    }
    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .context("Agent command produced no output")?;
    serde_json::from_str(last).context("Failed to parse agent output as JSON")
}
