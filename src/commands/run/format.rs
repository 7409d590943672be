//! Formatting functions for run output.
//!
//! Pure functions returning strings; printing happens in the caller.

use chrono::Duration;
use colored::Colorize;
use std::fmt::Write;

use crate::refine::{RunReport, Termination};
use crate::report::{OutcomeStatus, TestOutcome};

/// What the banner shows at run start.
#[derive(Debug, Clone)]
pub(crate) struct BannerInfo {
    pub requirement: String,
    pub codebase_path: String,
    pub image: String,
    pub report_format: String,
    pub max_attempts: u32,
}

/// Formats a duration for display (e.g., "2h 5m 30s").
pub(crate) fn format_duration(duration: &Duration) -> String {
    let total_seconds = duration.num_seconds().max(0);
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Formats the startup banner.
pub(crate) fn format_banner(info: &BannerInfo) -> String {
    let mut out = String::new();

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "{}", "   🔁 Refinement Run Starting".yellow().bold()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();

    writeln!(&mut out, "  Requirement: {}", info.requirement.cyan().bold()).unwrap();
    writeln!(&mut out, "  Codebase:    {}", info.codebase_path.cyan()).unwrap();
    writeln!(&mut out, "  Image:       {}", info.image.cyan()).unwrap();
    writeln!(&mut out, "  Report:      {}", info.report_format.cyan()).unwrap();
    writeln!(
        &mut out,
        "  Attempts:    {}",
        info.max_attempts.to_string().cyan()
    )
    .unwrap();
    writeln!(&mut out, "  Network:     {}", "disabled".green()).unwrap();

    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "\n  {} to stop\n", "Ctrl+C".dimmed()).unwrap();

    out
}

/// Formats one test outcome: counts plus each failure.
pub(crate) fn format_outcome(outcome: &TestOutcome) -> String {
    let mut out = String::new();

    let status = match outcome.status {
        OutcomeStatus::Pass => "PASS".green().bold(),
        OutcomeStatus::Fail => "FAIL".red().bold(),
        OutcomeStatus::Error => "ERROR".yellow().bold(),
    };
    writeln!(
        &mut out,
        "  {status}  {} passed, {} failed, {} errors {}",
        outcome.passed,
        outcome.failed,
        outcome.errors,
        format!("({})", outcome.format).dimmed()
    )
    .unwrap();

    for failure in &outcome.failures {
        writeln!(&mut out, "    {} {}", "✗".red(), failure.name.bold()).unwrap();
        for line in failure.message.lines().filter(|l| !l.trim().is_empty()) {
            writeln!(&mut out, "      {}", line.dimmed()).unwrap();
        }
    }

    out
}

/// Formats the end-of-run summary.
pub(crate) fn format_run_report(report: &RunReport) -> String {
    let mut out = String::new();

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    let headline = match &report.termination {
        Termination::Passed => format!("{} Tests passed", "✓".green().bold()),
        Termination::FailedAfterMax => format!(
            "{} Tests still failing after {} refinement attempt(s)",
            "✗".red().bold(),
            report.attempts
        ),
        Termination::Aborted(reason) => format!("{} Run aborted: {reason}", "⚠".yellow().bold()),
        Termination::Cancelled => format!("{} Run cancelled", "ℹ".blue()),
    };
    writeln!(&mut out, "  {headline}").unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();

    writeln!(
        &mut out,
        "  Test runs:   {}",
        report.test_runs.to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Refinements: {}",
        report.refine_runs.to_string().cyan()
    )
    .unwrap();
    let elapsed = report.finished_at.signed_duration_since(report.started_at);
    writeln!(&mut out, "  Duration:    {}", format_duration(&elapsed).cyan()).unwrap();

    if let Some(outcome) = &report.last_outcome {
        writeln!(&mut out, "\n  Last test run:").unwrap();
        out.push_str(&format_outcome(outcome));
    }

    out
}
