//! Write starter configuration into a project directory.
//!
//! The core logic takes closures for filesystem access so it can be
//! tested without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command in `root`.
pub(crate) fn run(root: &Path, force: bool) -> Result<()> {
    info!("Initializing refinery in {}", root.display());

    let files = init_files();
    let results = init_project(
        &files,
        force,
        |path| root.join(path).exists(),
        |path, content| {
            fs::write(root.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));
    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_files() -> Vec<InitFile> {
    vec![
        InitFile {
            path: PathBuf::from(CONFIG_FILE),
            content: templates::REFINERY_TOML,
            description: "Sandbox, loop and agent configuration",
        },
        InitFile {
            path: PathBuf::from("runner.Dockerfile"),
            content: templates::RUNNER_DOCKERFILE,
            description: "Test runner image",
        },
    ]
}

fn init_project<E, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::with_capacity(files.len());

    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => WriteResult::Overwritten,
            (false, _) => WriteResult::Created,
        };
        if result != WriteResult::Skipped {
            write_file(&file.path, file.content)?;
        }
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    let mut out = String::new();

    writeln!(&mut out, "\n{} refinery initialized\n", "✓".green().bold()).unwrap();

    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);

        match result {
            WriteResult::Created => {
                writeln!(&mut out, "  {} - {}", path.display().to_string().cyan(), desc).unwrap();
            }
            WriteResult::Overwritten => {
                writeln!(&mut out, "  {} {} (overwritten)", "↻".blue(), path.display()).unwrap();
            }
            WriteResult::Skipped => {
                writeln!(
                    &mut out,
                    "  {} {} (already exists, use --force to overwrite)",
                    "⊘".yellow(),
                    path.display()
                )
                .unwrap();
            }
        }
    }

    writeln!(&mut out, "\n{}", "Next steps:".yellow().bold()).unwrap();
    writeln!(
        &mut out,
        "  1. Build the runner: {}",
        "docker build -t refinery-runner:latest -f runner.Dockerfile .".green()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  2. Set your agent commands under {} in {}",
        "[agent]".cyan(),
        CONFIG_FILE.cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  3. Run {}",
        "refinery run --requirement \"...\"".green()
    )
    .unwrap();

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::report::ReportKind;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn record_writes(
        written: &RefCell<HashMap<PathBuf, String>>,
    ) -> impl FnMut(&Path, &str) -> Result<()> + '_ {
        move |path, content| {
            written
                .borrow_mut()
                .insert(path.to_path_buf(), content.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_config_template_matches_defaults() {
        let config: Config = toml::from_str(templates::REFINERY_TOML).unwrap();
        let defaults = Config::default();
        assert_eq!(config.sandbox.image, defaults.sandbox.image);
        assert_eq!(config.sandbox.command, defaults.sandbox.command);
        assert_eq!(config.refine.max_attempts, defaults.refine.max_attempts);
        assert_eq!(config.report.format, ReportKind::Pytest);
        assert!(config.agent.generate.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_init_project_creates_files() {
        let files = init_files();
        let written = RefCell::new(HashMap::new());

        let results = init_project(&files, false, |_| false, record_writes(&written)).unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Created));
        assert_eq!(written.borrow().len(), files.len());
        assert!(written.borrow().contains_key(Path::new(CONFIG_FILE)));
    }

    #[test]
    fn test_init_project_skips_existing_without_force() {
        let files = init_files();
        let written = RefCell::new(HashMap::new());

        let results = init_project(&files, false, |_| true, record_writes(&written)).unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Skipped));
        assert!(written.borrow().is_empty());
    }

    #[test]
    fn test_init_project_mixed_with_force() {
        let files = init_files();
        let written = RefCell::new(HashMap::new());

        let results = init_project(
            &files,
            true,
            |path| path == Path::new(CONFIG_FILE),
            record_writes(&written),
        )
        .unwrap();

        assert_eq!(
            results[0],
            (PathBuf::from(CONFIG_FILE), WriteResult::Overwritten)
        );
        assert_eq!(
            results[1],
            (PathBuf::from("runner.Dockerfile"), WriteResult::Created)
        );
        assert_eq!(written.borrow().len(), 2);
    }

    #[test]
    fn test_format_results_skipped() {
        let files = init_files();
        let results = vec![(PathBuf::from(CONFIG_FILE), WriteResult::Skipped)];

        let output = format_results(&results, &files);
        assert!(output.contains("already exists"));
        assert!(output.contains("--force"));
        assert!(output.contains("Next steps"));
    }
}
