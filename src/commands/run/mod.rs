//! Generate code for a requirement and refine it until its tests pass.
//!
//! Wires the configured agents, the Docker sandbox and the report parser
//! into the refinement loop, and persists the session when it ends.

mod format;

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::{AgentProvider, CommandProvider};
use crate::config::Config;
use crate::refine::{run_loop, LoopDependencies, LoopSettings};
use crate::sandbox::{CancelToken, DockerSandbox};
use crate::session::{keys, SessionRecord, SessionState};
use crate::workspace::{FileError, FileStore};

pub(crate) use format::format_outcome;
use format::{format_banner, format_run_report, BannerInfo};

/// Options for `refinery run`.
#[derive(Debug, Clone)]
pub(crate) struct RunOptions {
    pub requirement: String,
    pub max_attempts: Option<u32>,
    pub codebase_path: Option<String>,
}

/// Runs the loop. Returns true when the tests passed.
pub(crate) async fn run(root: &Path, options: RunOptions) -> Result<bool> {
    let mut config = Config::load(root)?;
    config.apply_env()?;
    if let Some(max_attempts) = options.max_attempts {
        config.refine.max_attempts = max_attempts;
    }

    let store = FileStore::open(root)?;
    let codebase_path = options.codebase_path.unwrap_or_else(|| ".".to_string());
    if !store.exists(&codebase_path).context("Invalid --codebase-path")? {
        bail!("Codebase path does not exist: {codebase_path}");
    }

    let (generator, refactorer) = agents(&config, store.root().path())?;

    let mut state = SessionState::new();
    state.set(keys::USER_REQUIREMENT, &options.requirement)?;
    state.set(keys::CODEBASE_PATH, &codebase_path)?;
    let listing = code_listing(&store, &codebase_path)?;
    if !listing.is_empty() {
        state.set(keys::CODE_CONTEXT, &listing)?;
    }

    print!(
        "{}",
        format_banner(&BannerInfo {
            requirement: options.requirement.clone(),
            codebase_path,
            image: config.sandbox.image.clone(),
            report_format: config.report.format.to_string(),
            max_attempts: config.refine.max_attempts,
        })
    );

    let deps = LoopDependencies {
        store,
        sandbox: Box::new(DockerSandbox::new(config.sandbox.pull_missing)),
        generator,
        refactorer,
        report: config.report.format.parser(),
    };
    let settings = LoopSettings::from_config(&config);

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let report = run_loop(&deps, &settings, &mut state, &cancel).await?;
    print!("{}", format_run_report(&report));

    let record = SessionRecord::new(state, Some(report.termination.to_string()), report.attempts);
    record.save(root)?;
    info!("Session saved to {}", root.join(crate::session::SESSION_FILE).display());

    Ok(report.termination.is_success())
}

/// Root-relative files under `codebase_path`, without hidden entries and
/// caches. Agents get it as their starting `code_context`.
fn code_listing(store: &FileStore, codebase_path: &str) -> Result<Vec<String>> {
    let base = Path::new(codebase_path);
    let entries = match store.list(base, true) {
        Ok(entries) => entries,
        Err(FileError::NotADirectory { .. }) => return Ok(vec![codebase_path.to_string()]),
        Err(e) => return Err(e.into()),
    };

    let files = entries
        .into_iter()
        .filter(|entry| {
            !entry.components().any(|c| {
                let name = c.as_os_str().to_string_lossy();
                name.starts_with('.') || name == "__pycache__"
            })
        })
        .map(|entry| if base == Path::new(".") { entry } else { base.join(entry) })
        .filter(|path| store.root().resolve(path).is_ok_and(|p| p.is_file()))
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    Ok(files)
}

/// Builds the generate and refactor agents. The refactor stage reuses the
/// generate command when it has none of its own.
fn agents(
    config: &Config,
    project_dir: &Path,
) -> Result<(Box<dyn AgentProvider>, Box<dyn AgentProvider>)> {
    let generate = config
        .agent
        .generate
        .as_deref()
        .context("No generate agent configured. Set [agent].generate in refinery.toml")?;
    let refactor = config.agent.refactor.as_deref().unwrap_or(generate);
    let timeout = Duration::from_secs(config.agent.timeout_secs);

    Ok((
        Box::new(CommandProvider::new(generate, project_dir, timeout)),
        Box::new(CommandProvider::new(refactor, project_dir, timeout)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agents_require_generate_command() {
        let config = Config::default();
        let err = agents(&config, Path::new("/tmp")).err().unwrap();
        assert!(err.to_string().contains("[agent].generate"));
    }

    #[test]
    fn test_agents_refactor_falls_back_to_generate() {
        let mut config = Config::default();
        config.agent.generate = Some("python agent.py".to_string());
        let (generator, refactorer) = agents(&config, Path::new("/tmp")).unwrap();
        assert_eq!(generator.name(), "command");
        assert_eq!(refactorer.name(), "command");
    }

    #[test]
    fn test_code_listing_skips_hidden_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write("calc.py", b"x = 1\n", true).unwrap();
        store.write("pkg/util.py", b"y = 2\n", true).unwrap();
        store.write("pkg/__pycache__/util.pyc", b"\0", true).unwrap();
        store.write(".refinery/session.json", b"{}", true).unwrap();

        assert_eq!(
            code_listing(&store, ".").unwrap(),
            vec!["calc.py".to_string(), "pkg/util.py".to_string()]
        );
        assert_eq!(
            code_listing(&store, "pkg").unwrap(),
            vec!["pkg/util.py".to_string()]
        );
        assert_eq!(
            code_listing(&store, "calc.py").unwrap(),
            vec!["calc.py".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_rejects_missing_codebase_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            dir.path(),
            RunOptions {
                requirement: "add two numbers".to_string(),
                max_attempts: None,
                codebase_path: Some("src".to_string()),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_run_rejects_escaping_codebase_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            dir.path(),
            RunOptions {
                requirement: "add two numbers".to_string(),
                max_attempts: None,
                codebase_path: Some("../elsewhere".to_string()),
            },
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("escapes project root"));
    }
}
