//! Show the last saved session.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use crate::report::TestOutcome;
use crate::session::{keys, SessionRecord};

use super::run::format_outcome;

/// Keys collaborators may fill in before generation.
const CONTEXT_KEYS: [&str; 3] = [
    keys::REQUIREMENT_DETAILS,
    keys::CODE_CONTEXT,
    keys::IMPLEMENTATION_PLAN,
];

pub(crate) fn run(root: &Path) -> Result<()> {
    match SessionRecord::load(root)? {
        Some(record) => print!("{}", format_status(&record)?),
        None => {
            println!("\n{} No saved session found.", "ℹ".blue());
            println!("  Run {} to start one.", "refinery run --requirement <text>".green());
        }
    }
    Ok(())
}

fn format_status(record: &SessionRecord) -> Result<String> {
    let state = &record.state;
    let mut out = String::new();

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "{}", "   🔁 Refinery Session".yellow().bold()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();

    let requirement = state
        .get_raw(keys::USER_REQUIREMENT)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    writeln!(&mut out, "  Requirement: {}", requirement.cyan()).unwrap();
    let codebase: Option<String> = state.get(keys::CODEBASE_PATH)?;
    writeln!(
        &mut out,
        "  Codebase:    {}",
        codebase.as_deref().unwrap_or(".").cyan()
    )
    .unwrap();

    let result = match record.termination.as_deref() {
        Some("passed") => "passed".green().bold(),
        Some(other) => other.red(),
        None => "unfinished".yellow(),
    };
    writeln!(&mut out, "  Result:      {result}").unwrap();
    writeln!(
        &mut out,
        "  Attempts:    {}",
        record.attempts.to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Saved:       {}",
        record
            .saved_at
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
            .cyan()
    )
    .unwrap();

    let generated: Vec<String> = state.get(keys::GENERATED_CODE_PATHS)?.unwrap_or_default();
    let tests: Vec<String> = state.get(keys::TEST_PATHS)?.unwrap_or_default();
    if !generated.is_empty() || !tests.is_empty() {
        writeln!(&mut out, "\n  Files:").unwrap();
        for path in &generated {
            writeln!(&mut out, "    {}", path.cyan()).unwrap();
        }
        for path in tests.iter().filter(|p| !generated.contains(p)) {
            writeln!(&mut out, "    {} {}", path.cyan(), "(test)".dimmed()).unwrap();
        }
    }

    let context: Vec<&str> = CONTEXT_KEYS
        .into_iter()
        .filter(|key| state.contains(key))
        .collect();
    if !context.is_empty() {
        writeln!(&mut out, "  Context:     {}", context.join(", ").dimmed()).unwrap();
    }
    let other = state
        .keys()
        .filter(|key| !is_well_known(key))
        .count();
    if other > 0 {
        writeln!(&mut out, "  Extra keys:  {}", other.to_string().dimmed()).unwrap();
    }

    if let Some(outcome) = state.get::<TestOutcome>(keys::TEST_RESULTS)? {
        writeln!(&mut out, "\n  Last test run:").unwrap();
        out.push_str(&format_outcome(&outcome));
    }
    if let Some(summary) = state.get::<String>(keys::VERSIONING_SUMMARY)? {
        writeln!(&mut out, "\n  Versioning:  {}", summary.dimmed()).unwrap();
    }

    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();
    Ok(out)
}

fn is_well_known(key: &str) -> bool {
    CONTEXT_KEYS.contains(&key)
        || [
            keys::USER_REQUIREMENT,
            keys::CODEBASE_PATH,
            keys::GENERATED_CODE_PATHS,
            keys::TEST_PATHS,
            keys::TEST_RESULTS,
            keys::REFACTORED_CODE_PATHS,
            keys::REFACTOR_ATTEMPT,
            keys::VERSIONING_SUMMARY,
        ]
        .contains(&key)
}
