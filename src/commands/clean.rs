//! Remove leftover sandbox containers and, optionally, the saved session.
//!
//! Containers are found by the label every sandbox run carries, so only
//! containers created by this tool are touched.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;
use tracing::warn;

use crate::sandbox::{DockerSandbox, Sandbox, SandboxError};
use crate::session::{SessionRecord, SESSION_FILE};

/// What a clean removed.
#[derive(Debug, Default, PartialEq, Eq)]
struct CleanSummary {
    /// Containers removed, or `None` when Docker was unreachable.
    containers: Option<u32>,
    session_removed: bool,
}

pub(crate) async fn run(root: &Path, state: bool) -> Result<()> {
    let mut summary = CleanSummary {
        session_removed: state && SessionRecord::delete(root)?,
        ..CleanSummary::default()
    };

    match DockerSandbox::new(false).cleanup_orphaned().await {
        Ok(removed) => summary.containers = Some(removed),
        Err(e) => {
            let unavailable = e
                .downcast_ref::<SandboxError>()
                .is_some_and(SandboxError::is_docker_unavailable);
            if !unavailable {
                return Err(e);
            }
            warn!("Skipping container cleanup: {e}");
        }
    }

    print!("{}", format_results(&summary, state));
    Ok(())
}

fn format_results(summary: &CleanSummary, state: bool) -> String {
    let mut out = String::new();

    match summary.containers {
        Some(0) => writeln!(&mut out, "\n{} No leftover sandbox containers.", "ℹ".blue()).unwrap(),
        Some(n) => writeln!(
            &mut out,
            "\n{} Removed {} sandbox container(s).",
            "✓".green(),
            n.to_string().cyan()
        )
        .unwrap(),
        None => writeln!(
            &mut out,
            "\n{} Docker is not available; containers were not checked.",
            "⚠".yellow()
        )
        .unwrap(),
    }

    if summary.session_removed {
        writeln!(
            &mut out,
            "{} Removed {}",
            "✓".green(),
            SESSION_FILE.dimmed()
        )
        .unwrap();
    } else if state {
        writeln!(&mut out, "{} No saved session to remove.", "ℹ".blue()).unwrap();
    }

    out
}
