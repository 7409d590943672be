//! The bounded generate → test → refine loop.
//!
//! ```text
//! Generate → Test ─┬─ Pass ──────────────────────────→ Done(Passed)
//!                  ├─ fail, attempt < max → Refine → Test
//!                  └─ fail, attempt ≥ max ───────────→ Done(FailedAfterMax)
//! ```
//!
//! Any phase may also end in `Aborted(reason)` or `Cancelled`. The loop is
//! the only owner of the attempt counter; collaborators see it through the
//! `refactor_attempt` session key.

pub(crate) mod git;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::{AgentOutput, AgentProvider, Stage};
use crate::config::{Config, GitConfig, RefineConfig, SandboxConfig, SandboxErrorPolicy};
use crate::report::{self, OutcomeStatus, ReportFormat, TestOutcome};
use crate::sandbox::{CancelToken, Sandbox, SandboxSpec, SandboxStatus};
use crate::session::{keys, SessionState};
use crate::workspace::{FileError, FileStore};

/// Refactor attempts allowed after the first failing test run.
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Collaborators driven by the loop.
pub(crate) struct LoopDependencies {
    pub store: FileStore,
    pub sandbox: Box<dyn Sandbox>,
    pub generator: Box<dyn AgentProvider>,
    pub refactorer: Box<dyn AgentProvider>,
    pub report: Box<dyn ReportFormat>,
}

/// Loop configuration, taken from `refinery.toml`.
#[derive(Debug, Clone)]
pub(crate) struct LoopSettings {
    pub sandbox: SandboxConfig,
    pub refine: RefineConfig,
    pub git: GitConfig,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sandbox: config.sandbox.clone(),
            refine: config.refine.clone(),
            git: config.git.clone(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub(crate) enum Termination {
    /// Tests passed.
    Passed,
    /// Tests still failing after the last allowed refactor.
    FailedAfterMax,
    /// A collaborator, the file store or the sandbox gave up.
    Aborted(String),
    /// The caller cancelled the run.
    Cancelled,
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::FailedAfterMax => write!(f, "failed after max attempts"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Generate,
    Test,
    Refine,
    Done(Termination),
}

/// Next phase after a test run that was not an infrastructure failure.
fn after_test(status: OutcomeStatus, attempt: u32, max_attempts: u32) -> Phase {
    if status == OutcomeStatus::Pass {
        Phase::Done(Termination::Passed)
    } else if attempt < max_attempts {
        Phase::Refine
    } else {
        Phase::Done(Termination::FailedAfterMax)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunReport {
    pub termination: Termination,
    /// Refactor attempts made.
    pub attempts: u32,
    /// Test phases entered, including sandbox retries.
    pub test_runs: u32,
    /// Refine phases entered.
    pub refine_runs: u32,
    pub last_outcome: Option<TestOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Progress {
    attempt: u32,
    test_runs: u32,
    refine_runs: u32,
    sandbox_retries: u32,
    last_outcome: Option<TestOutcome>,
}

/// Runs the loop to a terminal state.
///
/// Errors are reserved for session state that cannot be serialized;
/// every other failure ends the run with `Termination::Aborted`.
pub(crate) async fn run_loop(
    deps: &LoopDependencies,
    settings: &LoopSettings,
    state: &mut SessionState,
    cancel: &CancelToken,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let mut progress = Progress::default();

    state.remove(keys::TEST_RESULTS);
    state.set(keys::REFACTOR_ATTEMPT, &0u32)?;

    info!(
        event = "loop_start",
        max_attempts = settings.refine.max_attempts,
        sandbox = deps.sandbox.name(),
        report = deps.report.name(),
        generator = deps.generator.name(),
        "Starting refinement loop"
    );

    let mut phase = Phase::Generate;
    let termination = loop {
        if cancel.is_cancelled() && !matches!(phase, Phase::Done(_)) {
            phase = Phase::Done(Termination::Cancelled);
        }
        phase = match phase {
            Phase::Done(termination) => break termination,
            Phase::Generate => generate(deps, state, cancel).await?,
            Phase::Test => run_tests(deps, settings, state, cancel, &mut progress).await?,
            Phase::Refine => refine(deps, settings, state, cancel, &mut progress).await?,
        };
    };

    if termination.is_success() && settings.git.commit_on_pass {
        let summary = version(deps, settings, state).await;
        state.set(keys::VERSIONING_SUMMARY, &summary)?;
    }

    info!(
        event = "loop_end",
        termination = %termination,
        attempts = progress.attempt,
        test_runs = progress.test_runs,
        refine_runs = progress.refine_runs,
        "Refinement loop finished"
    );

    Ok(RunReport {
        termination,
        attempts: progress.attempt,
        test_runs: progress.test_runs,
        refine_runs: progress.refine_runs,
        last_outcome: progress.last_outcome,
        started_at,
        finished_at: Utc::now(),
    })
}

async fn generate(
    deps: &LoopDependencies,
    state: &mut SessionState,
    cancel: &CancelToken,
) -> Result<Phase> {
    let output = match invoke(deps.generator.as_ref(), Stage::Generate, state, cancel).await {
        Ok(output) => output,
        Err(termination) => return Ok(Phase::Done(termination)),
    };
    let sets_paths = output.state.contains_key(keys::GENERATED_CODE_PATHS);

    let written = match apply_output(&deps.store, state, output) {
        Ok(written) => written,
        Err(e) => return Ok(rejected_file(Stage::Generate, &e)),
    };
    if !sets_paths && !written.is_empty() {
        state.set(keys::GENERATED_CODE_PATHS, &written)?;
    }

    let paths: Vec<String> = match state.get(keys::GENERATED_CODE_PATHS) {
        Ok(paths) => paths.unwrap_or_default(),
        Err(e) => return Ok(aborted(format!("{e:#}"))),
    };
    if paths.is_empty() {
        return Ok(aborted("generation produced no code"));
    }

    info!(event = "generated", files = written.len(), "Code generated");
    Ok(Phase::Test)
}

async fn run_tests(
    deps: &LoopDependencies,
    settings: &LoopSettings,
    state: &mut SessionState,
    cancel: &CancelToken,
    progress: &mut Progress,
) -> Result<Phase> {
    progress.test_runs += 1;

    let (code_paths, test_paths) = match test_inputs(state) {
        Ok(inputs) => inputs,
        Err(e) => return Ok(aborted(format!("{e:#}"))),
    };
    let snapshot = match deps.store.snapshot(code_paths.iter().chain(&test_paths)) {
        Ok(snapshot) => snapshot,
        Err(e) if e.is_not_found() => {
            return Ok(aborted(format!("a file listed in the session is missing: {e}")));
        }
        Err(e) => return Ok(aborted(format!("cannot collect test inputs: {e}"))),
    };
    let args = match test_paths
        .iter()
        .map(|path| root_relative(&deps.store, path))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(args) => args,
        Err(e) => return Ok(aborted(format!("invalid test path: {e}"))),
    };
    let spec = match SandboxSpec::from_config(&settings.sandbox, &args) {
        Ok(spec) => spec,
        Err(e) => return Ok(aborted(format!("{e:#}"))),
    };

    info!(
        event = "test_start",
        run = progress.test_runs,
        attempt = progress.attempt,
        files = snapshot.len(),
        "Running tests"
    );
    let result = deps.sandbox.execute(&spec, &snapshot, cancel).await;
    let outcome = report::parse(&result, deps.report.as_ref());
    state.set(keys::TEST_RESULTS, &outcome)?;

    info!(
        event = "test_result",
        sandbox_status = %result.status,
        status = %outcome.status,
        passed = outcome.passed,
        failed = outcome.failed,
        errors = outcome.errors,
        "Tests finished"
    );
    let status = outcome.status;
    progress.last_outcome = Some(outcome);

    match result.status {
        SandboxStatus::Cancelled => return Ok(Phase::Done(Termination::Cancelled)),
        SandboxStatus::SandboxError => {
            let diagnostic = result.diagnostic.unwrap_or_default();
            match settings.refine.sandbox_error_policy {
                SandboxErrorPolicy::Consume => {}
                SandboxErrorPolicy::Abort => {
                    return Ok(aborted(format!("sandbox error: {diagnostic}")));
                }
                SandboxErrorPolicy::Retry => {
                    progress.sandbox_retries += 1;
                    if progress.sandbox_retries > settings.refine.max_sandbox_retries {
                        return Ok(aborted(format!(
                            "sandbox error after {} retries: {diagnostic}",
                            settings.refine.max_sandbox_retries
                        )));
                    }
                    warn!(
                        event = "sandbox_retry",
                        retry = progress.sandbox_retries,
                        error = %diagnostic,
                        "Sandbox failed, re-running tests"
                    );
                    let backoff = Duration::from_secs(settings.refine.retry_backoff_secs);
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(Phase::Done(Termination::Cancelled)),
                        () = tokio::time::sleep(backoff) => {}
                    }
                    return Ok(Phase::Test);
                }
            }
        }
        SandboxStatus::Completed | SandboxStatus::TimedOut => progress.sandbox_retries = 0,
    }

    Ok(after_test(status, progress.attempt, settings.refine.max_attempts))
}

async fn refine(
    deps: &LoopDependencies,
    settings: &LoopSettings,
    state: &mut SessionState,
    cancel: &CancelToken,
    progress: &mut Progress,
) -> Result<Phase> {
    progress.attempt += 1;
    progress.refine_runs += 1;
    state.set(keys::REFACTOR_ATTEMPT, &progress.attempt)?;

    info!(
        event = "refine_start",
        attempt = progress.attempt,
        max_attempts = settings.refine.max_attempts,
        "Refactoring after failed tests"
    );

    let output = match invoke(deps.refactorer.as_ref(), Stage::Refactor, state, cancel).await {
        Ok(output) => output,
        Err(termination) => return Ok(Phase::Done(termination)),
    };
    let sets_paths = output.state.contains_key(keys::REFACTORED_CODE_PATHS);

    let written = match apply_output(&deps.store, state, output) {
        Ok(written) => written,
        Err(e) => return Ok(rejected_file(Stage::Refactor, &e)),
    };
    if !sets_paths {
        state.set(keys::REFACTORED_CODE_PATHS, &written)?;
    }

    // New files written during a refactor are tested from now on.
    let mut generated: Vec<String> = match state.get(keys::GENERATED_CODE_PATHS) {
        Ok(paths) => paths.unwrap_or_default(),
        Err(e) => return Ok(aborted(format!("{e:#}"))),
    };
    for path in written {
        if !generated.contains(&path) {
            generated.push(path);
        }
    }
    state.set(keys::GENERATED_CODE_PATHS, &generated)?;

    Ok(Phase::Test)
}

async fn invoke(
    agent: &dyn AgentProvider,
    stage: Stage,
    state: &SessionState,
    cancel: &CancelToken,
) -> Result<AgentOutput, Termination> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Termination::Cancelled),
        result = agent.invoke(stage, state) => result.map_err(|e| {
            warn!(stage = %stage, agent = agent.name(), error = %e, "Agent failed");
            Termination::Aborted(format!("{stage} agent failed: {e:#}"))
        }),
    }
}

/// Session keys only the loop writes.
const LOOP_OWNED_KEYS: [&str; 3] = [
    keys::TEST_RESULTS,
    keys::REFACTOR_ATTEMPT,
    keys::VERSIONING_SUMMARY,
];

/// Merges session updates and writes proposed files. Returns the
/// root-relative paths written.
fn apply_output(
    store: &FileStore,
    state: &mut SessionState,
    output: AgentOutput,
) -> Result<Vec<String>, FileError> {
    let mut updates = output.state;
    for key in LOOP_OWNED_KEYS {
        if updates.remove(key).is_some() {
            debug!(key, "Ignoring agent update to a loop-owned key");
        }
    }
    state.merge(updates);
    let mut written = Vec::with_capacity(output.files.len());
    for file in &output.files {
        store.write(&file.path, file.content.as_bytes(), file.overwrite)?;
        written.push(root_relative(store, &file.path)?);
    }
    Ok(written)
}

/// Validates `path` and returns its normalized root-relative form.
fn root_relative(store: &FileStore, path: &str) -> Result<String, FileError> {
    let resolved = store.root().resolve(path)?;
    let relative = store
        .root()
        .relative_of(&resolved)
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| ".".to_string(), |p| p.to_string_lossy().into_owned());
    Ok(relative)
}

fn test_inputs(state: &SessionState) -> Result<(Vec<String>, Vec<String>)> {
    let code_paths: Vec<String> = state.get(keys::GENERATED_CODE_PATHS)?.unwrap_or_default();
    let test_paths: Vec<String> = state.get(keys::TEST_PATHS)?.unwrap_or_default();
    Ok((code_paths, test_paths))
}

/// Generated and test paths, each once, in a stable order.
fn versioned_paths(state: &SessionState) -> Result<Vec<String>> {
    let (code, tests) = test_inputs(state)?;
    let paths: BTreeSet<String> = code.into_iter().chain(tests).collect();
    Ok(paths.into_iter().collect())
}

async fn version(deps: &LoopDependencies, settings: &LoopSettings, state: &SessionState) -> String {
    let paths = match versioned_paths(state) {
        Ok(paths) => paths,
        Err(e) => return format!("Versioning skipped: {e:#}"),
    };

    match git::commit_paths(deps.store.root().path(), &paths, &settings.git.commit_message).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "Versioning failed");
            format!("Versioning failed: {e:#}")
        }
    }
}

fn rejected_file(stage: Stage, err: &FileError) -> Phase {
    if err.is_path_escape() {
        warn!(event = "path_escape", stage = %stage, error = %err, "Agent tried to write outside the project root");
    }
    aborted(format!("{stage} agent proposed a bad file: {err}"))
}

fn aborted(reason: impl Into<String>) -> Phase {
    let reason = reason.into();
    warn!(event = "loop_abort", reason = %reason, "Aborting refinement loop");
    Phase::Done(Termination::Aborted(reason))
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
