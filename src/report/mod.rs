//! Test report parsing.
//!
//! Turns a raw `SandboxResult` into a `TestOutcome`. The grammar of the
//! runner's output is selected with `report.format` and versioned, so a
//! runner upgrade that changes its output is a visible format bump rather
//! than silent misclassification.

mod pytest;
mod tap;

pub(crate) use pytest::PytestFormat;
pub(crate) use tap::TapFormat;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sandbox::{SandboxResult, SandboxStatus};

/// Name used for failures synthesized from a non-completed run.
pub(crate) const SANDBOX_ENTRY: &str = "<sandbox>";

/// Name used for failures synthesized from unusable runner output.
pub(crate) const REPORT_ENTRY: &str = "<report>";

/// Lines of output kept in synthesized failure messages.
const TAIL_LINES: usize = 20;

/// Overall classification of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OutcomeStatus {
    /// Every recognized test passed.
    Pass,
    /// The runner reported failing or erroring tests.
    Fail,
    /// The run could not be interpreted (or never completed).
    Error,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One failing test and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TestFailure {
    pub name: String,
    pub message: String,
}

impl TestFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Structured result of one test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TestOutcome {
    pub status: OutcomeStatus,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub failures: Vec<TestFailure>,
    /// Report grammar used, e.g. `pytest/1`.
    pub format: String,
}

impl TestOutcome {
    /// Returns true if the run passed.
    pub fn is_pass(&self) -> bool {
        self.status == OutcomeStatus::Pass
    }
}

/// Counts and failures recognized in runner output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedReport {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub failures: Vec<TestFailure>,
}

impl ParsedReport {
    /// Counts come from untrusted output, so sums saturate.
    fn total(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.errors)
            .saturating_add(self.skipped)
    }
}

/// A versioned grammar for one test runner's output.
pub(crate) trait ReportFormat: Send + Sync {
    /// Format name for display and config.
    fn name(&self) -> &'static str;

    /// Grammar version. Bumped whenever recognition rules change.
    fn version(&self) -> u32;

    /// Extracts counts and failures. Never fails; unrecognized output
    /// yields an empty report.
    fn parse(&self, stdout: &str, stderr: &str) -> ParsedReport;
}

/// Supported report formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ReportKind {
    /// pytest terminal output (`-rfE` recommended).
    #[default]
    Pytest,
    /// Test Anything Protocol, version 13.
    Tap,
}

impl ReportKind {
    /// Returns the parser for this format.
    pub fn parser(self) -> Box<dyn ReportFormat> {
        match self {
            Self::Pytest => Box::new(PytestFormat),
            Self::Tap => Box::new(TapFormat),
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pytest => write!(f, "pytest"),
            Self::Tap => write!(f, "tap"),
        }
    }
}

impl std::str::FromStr for ReportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pytest" => Ok(Self::Pytest),
            "tap" => Ok(Self::Tap),
            _ => anyhow::bail!("Unknown report format: '{s}'. Supported: pytest, tap"),
        }
    }
}

/// Derives a `TestOutcome` from a sandbox result. Pure and deterministic.
pub(crate) fn parse(result: &SandboxResult, format: &dyn ReportFormat) -> TestOutcome {
    let format_tag = format!("{}/{}", format.name(), format.version());

    let Some(exit_code) = result.exit_code.filter(|_| result.status == SandboxStatus::Completed)
    else {
        return TestOutcome {
            status: OutcomeStatus::Error,
            passed: 0,
            failed: 0,
            errors: 0,
            failures: vec![TestFailure::new(SANDBOX_ENTRY, sandbox_message(result))],
            format: format_tag,
        };
    };

    let report = format.parse(&result.stdout, &result.stderr);
    let status = classify(&report, exit_code);

    let total = report.total();
    let mut failures = report.failures;
    if status == OutcomeStatus::Error && failures.is_empty() {
        let reason = if total == 0 {
            format!("no tests recognized in {format_tag} output (exit code {exit_code})")
        } else {
            format!("exit code {exit_code} contradicts the reported results")
        };
        failures.push(TestFailure::new(
            REPORT_ENTRY,
            with_tail(reason, &result.stdout, &result.stderr),
        ));
    }

    TestOutcome {
        status,
        passed: report.passed,
        failed: report.failed,
        errors: report.errors,
        failures,
        format: format_tag,
    }
}

fn classify(report: &ParsedReport, exit_code: i64) -> OutcomeStatus {
    let problems = report.failed.saturating_add(report.errors);
    if report.total() == 0 {
        OutcomeStatus::Error
    } else if exit_code == 0 && problems == 0 {
        OutcomeStatus::Pass
    } else if exit_code != 0 && problems > 0 {
        OutcomeStatus::Fail
    } else {
        OutcomeStatus::Error
    }
}

fn sandbox_message(result: &SandboxResult) -> String {
    let secs = result.duration.as_secs_f64();
    match result.status {
        SandboxStatus::TimedOut => {
            with_tail(format!("timed out after {secs:.1}s"), &result.stdout, &result.stderr)
        }
        SandboxStatus::Cancelled => format!("cancelled after {secs:.1}s"),
        SandboxStatus::SandboxError => format!(
            "sandbox error: {}",
            result.diagnostic.as_deref().unwrap_or("unknown failure")
        ),
        // Completed without an exit code cannot be produced by a sandbox.
        SandboxStatus::Completed => "completed without an exit code".to_string(),
    }
}

fn with_tail(reason: String, stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return reason;
    }
    let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];
    format!("{reason}\n{}", tail.join("\n"))
}
