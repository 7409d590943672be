//! Versioning of generated code.
//!
//! After a passing run the generated files can be committed to the
//! project's git repository, initializing one if needed.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Output;
use tracing::{debug, info};

async fn git(cwd: &Path, args: &[&str]) -> Result<Output> {
    tokio::process::Command::new("git")
        .current_dir(cwd)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))
}

fn check(output: &Output, what: &str) -> Result<()> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {what} failed: {}", stderr.trim());
    }
    Ok(())
}

/// Returns true if `cwd` is inside a git work tree.
pub(crate) async fn is_repository(cwd: &Path) -> bool {
    git(cwd, &["rev-parse", "--is-inside-work-tree"])
        .await
        .is_ok_and(|output| output.status.success())
}

/// Get the current git commit hash (short format).
async fn get_current_commit_hash(cwd: &Path) -> Result<String> {
    let output = git(cwd, &["rev-parse", "--short", "HEAD"]).await?;
    check(&output, "rev-parse")?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Commits `paths` (relative to `cwd`) and returns a one-line summary.
///
/// Initializes the repository when missing. Falls back to a local
/// identity when none is configured so the commit cannot fail on it.
pub(crate) async fn commit_paths(cwd: &Path, paths: &[String], message: &str) -> Result<String> {
    if paths.is_empty() {
        bail!("No paths to commit");
    }

    if !is_repository(cwd).await {
        info!("Initializing git repository in {}", cwd.display());
        check(&git(cwd, &["init"]).await?, "init")?;
    }

    let mut add = vec!["add", "--"];
    add.extend(paths.iter().map(String::as_str));
    check(&git(cwd, &add).await?, "add")?;

    let mut staged = vec!["diff", "--cached", "--quiet", "--"];
    staged.extend(paths.iter().map(String::as_str));
    if git(cwd, &staged).await?.status.success() {
        debug!("Nothing staged for commit");
        return Ok("No changes to commit".to_string());
    }

    let identity = git(cwd, &["config", "user.email"]).await?;
    let mut commit = Vec::new();
    if !identity.status.success() || String::from_utf8_lossy(&identity.stdout).trim().is_empty() {
        commit.extend(["-c", "user.name=refinery", "-c", "user.email=refinery@localhost"]);
    }
    commit.extend(["commit", "-m", message, "--"]);
    commit.extend(paths.iter().map(String::as_str));
    check(&git(cwd, &commit).await?, "commit")?;

    let hash = get_current_commit_hash(cwd).await?;
    info!(event = "versioned", commit = %hash, files = paths.len(), "Committed generated code");
    Ok(format!("Committed {} file(s) as {hash}: {message}", paths.len()))
}
