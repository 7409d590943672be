//! Collaborators that write and fix code.
//!
//! The loop treats them as opaque: an agent receives the session state
//! and answers with files to write plus session updates. How it decides
//! what to write (prompts, models, credentials) is its own business.
//!
//! - `CommandProvider`: runs an external process speaking JSON over stdio
//! - `MockAgentProvider`: scripted outputs for tests

mod command;
#[cfg(test)]
mod mock;

pub(crate) use command::CommandProvider;
#[cfg(test)]
pub(crate) use mock::{MockAgentProvider, MockResponse};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::SessionState;

/// Which step of the loop is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Stage {
    /// Produce the initial implementation and tests.
    Generate,
    /// Fix the code using `test_results`.
    Refactor,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Refactor => write!(f, "refactor"),
        }
    }
}

/// A file the agent wants written, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ProposedFile {
    pub path: String,
    pub content: String,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

impl ProposedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            overwrite: true,
        }
    }
}

fn default_overwrite() -> bool {
    true
}

/// What an agent hands back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct AgentOutput {
    #[serde(default)]
    pub files: Vec<ProposedFile>,
    /// Session updates, merged over the current state.
    #[serde(default)]
    pub state: Map<String, Value>,
}

/// Trait for code-producing collaborators.
#[async_trait]
pub(crate) trait AgentProvider: Send + Sync {
    /// Returns the provider name for display.
    fn name(&self) -> &'static str;

    /// Invokes the agent for `stage` with read access to the session.
    async fn invoke(&self, stage: Stage, state: &SessionState) -> Result<AgentOutput>;
}
