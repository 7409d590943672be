//! Scripted sandbox for testing.
//!
//! Returns predetermined results and records what it was asked to run,
//! so refinement loop tests can drive every outcome without Docker.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CancelToken, Sandbox, SandboxResult, SandboxSpec};
use crate::workspace::FileSnapshot;

/// A sandbox that replays results in order.
///
/// Cycles back to the first result if executed more times than scripted.
#[derive(Debug, Clone)]
pub(crate) struct ScriptedSandbox {
    results: Arc<Vec<SandboxResult>>,
    execution_count: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    snapshots: Arc<Mutex<Vec<FileSnapshot>>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<SandboxResult>) -> Self {
        assert!(!results.is_empty(), "at least one scripted result");
        Self {
            results: Arc::new(results),
            execution_count: Arc::new(AtomicUsize::new(0)),
            commands: Arc::new(Mutex::new(Vec::new())),
            snapshots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A sandbox whose runs always exit with `code` and print `stdout`.
    pub fn always(code: i64, stdout: &str) -> Self {
        Self::new(vec![completed(code, stdout)])
    }

    pub fn execution_count(&self) -> usize {
        self.execution_count.load(Ordering::SeqCst)
    }

    /// Commands received, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// Snapshots received, in order.
    pub fn snapshots(&self) -> Vec<FileSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

/// Shorthand for a completed result.
pub(crate) fn completed(code: i64, stdout: &str) -> SandboxResult {
    SandboxResult::completed(
        code,
        stdout.to_string(),
        String::new(),
        Duration::from_millis(10),
    )
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(
        &self,
        spec: &SandboxSpec,
        snapshot: &FileSnapshot,
        cancel: &CancelToken,
    ) -> SandboxResult {
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(spec.command().to_vec());
        self.snapshots.lock().unwrap().push(snapshot.clone());

        if cancel.is_cancelled() {
            return SandboxResult::cancelled(String::new(), String::new(), Duration::ZERO);
        }
        self.results[count % self.results.len()].clone()
    }

    async fn cleanup_orphaned(&self) -> Result<u32> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxStatus;

    fn spec() -> SandboxSpec {
        SandboxSpec::new("img", vec!["pytest".to_string()], Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_scripted_sandbox_cycles() {
        let sandbox = ScriptedSandbox::new(vec![completed(1, "first"), completed(0, "second")]);
        let cancel = CancelToken::new();
        let snapshot = FileSnapshot::new();

        let r1 = sandbox.execute(&spec(), &snapshot, &cancel).await;
        let r2 = sandbox.execute(&spec(), &snapshot, &cancel).await;
        let r3 = sandbox.execute(&spec(), &snapshot, &cancel).await;

        assert_eq!(r1.stdout, "first");
        assert_eq!(r2.stdout, "second");
        assert_eq!(r3.stdout, "first");
        assert_eq!(sandbox.execution_count(), 3);
        assert_eq!(sandbox.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_sandbox_honours_cancel() {
        let sandbox = ScriptedSandbox::always(0, "ok");
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = sandbox.execute(&spec(), &FileSnapshot::new(), &cancel).await;
        assert_eq!(result.status, SandboxStatus::Cancelled);
    }
}
