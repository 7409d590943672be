//! Sandboxed execution of commands against a file snapshot.
//!
//! A `Sandbox` materializes a snapshot inside an isolated environment,
//! runs one command with networking disabled and resource limits applied,
//! and reports the raw outcome. Infrastructure failures are reported as a
//! `SandboxError` status, never as a test failure.

mod cancel;
mod docker;
mod error;
#[cfg(test)]
mod mock;
mod spec;

pub(crate) use cancel::CancelToken;
pub(crate) use docker::DockerSandbox;
pub(crate) use error::SandboxError;
#[cfg(test)]
pub(crate) use mock::{completed, ScriptedSandbox};
pub(crate) use spec::{SandboxResult, SandboxSpec, SandboxStatus, DEFAULT_WORKDIR};

use anyhow::Result;
use async_trait::async_trait;

use crate::workspace::FileSnapshot;

/// Trait for sandbox implementations.
#[async_trait]
pub(crate) trait Sandbox: Send + Sync {
    /// Returns the backend name for display.
    fn name(&self) -> &'static str;

    /// Runs `spec` against `snapshot`.
    ///
    /// Always returns a result: timeouts, cancellation and runtime
    /// failures are expressed through `SandboxResult::status`. Every
    /// resource created for the run is released before returning.
    async fn execute(
        &self,
        spec: &SandboxSpec,
        snapshot: &FileSnapshot,
        cancel: &CancelToken,
    ) -> SandboxResult;

    /// Removes leftovers from crashed runs. Returns how many were removed.
    async fn cleanup_orphaned(&self) -> Result<u32>;
}
