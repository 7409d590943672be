//! Run tests on existing files in the sandbox, without agents.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;

use crate::config::Config;
use crate::report::{self, ReportKind, TestOutcome};
use crate::sandbox::{CancelToken, DockerSandbox, Sandbox, SandboxResult, SandboxSpec, SandboxStatus};
use crate::workspace::FileStore;

use super::run::format_outcome;

/// Options for `refinery exec`.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecOptions {
    /// Files or directories copied into the sandbox.
    pub paths: Vec<String>,
    /// Test paths appended to the command (also copied).
    pub tests: Vec<String>,
    /// Overrides `[sandbox].command`.
    pub command: Option<String>,
    /// Overrides `[report].format`.
    pub format: Option<ReportKind>,
    /// Print JSON instead of the human summary.
    pub json: bool,
}

#[derive(Serialize)]
struct ExecOutput<'a> {
    sandbox: &'a SandboxResult,
    outcome: &'a TestOutcome,
}

/// Runs the command once. Returns true when the tests passed.
pub(crate) async fn run(root: &Path, options: ExecOptions) -> Result<bool> {
    let mut config = Config::load(root)?;
    if let Some(command) = options.command {
        config.sandbox.command = command;
    }
    let format = options.format.unwrap_or(config.report.format);

    let store = FileStore::open(root)?;
    let mut paths = options.paths;
    if paths.is_empty() && options.tests.is_empty() {
        paths.push(".".to_string());
    }
    let snapshot = store.snapshot(paths.iter().chain(&options.tests))?;
    for test in &options.tests {
        store.root().resolve(test)?;
    }
    let spec = SandboxSpec::from_config(&config.sandbox, &options.tests)
        .context("Invalid [sandbox] configuration")?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let sandbox = DockerSandbox::new(config.sandbox.pull_missing);
    let result = sandbox.execute(&spec, &snapshot, &cancel).await;
    let outcome = report::parse(&result, format.parser().as_ref());

    if options.json {
        let output = ExecOutput {
            sandbox: &result,
            outcome: &outcome,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialize result")?
        );
    } else {
        print!("{}", format_exec(&result, &outcome));
    }

    Ok(outcome.is_pass())
}

fn format_exec(result: &SandboxResult, outcome: &TestOutcome) -> String {
    let mut out = String::new();

    let status = match result.status {
        SandboxStatus::Completed => result.status.to_string().green(),
        _ => result.status.to_string().yellow(),
    };
    writeln!(
        &mut out,
        "\n  Sandbox: {status} (exit code {}, {:.1}s)",
        result
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string()),
        result.duration.as_secs_f64()
    )
    .unwrap();
    if let Some(diagnostic) = &result.diagnostic {
        writeln!(&mut out, "  {}", diagnostic.dimmed()).unwrap();
    }
    out.push_str(&format_outcome(outcome));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::OutcomeStatus;
    use std::time::Duration;

    #[test]
    fn test_format_exec_shows_sandbox_error() {
        let result = SandboxResult::sandbox_error(
            "Docker is not available: connection refused",
            Duration::from_millis(5),
        );
        let outcome = report::parse(&result, ReportKind::Pytest.parser().as_ref());
        assert_eq!(outcome.status, OutcomeStatus::Error);

        let out = format_exec(&result, &outcome);
        assert!(out.contains("sandbox-error"));
        assert!(out.contains("exit code none"));
        assert!(out.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_exec_rejects_escaping_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            dir.path(),
            ExecOptions {
                paths: vec!["../../etc".to_string()],
                ..ExecOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("escapes project root"));
    }
}
