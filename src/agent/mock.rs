//! Mock agent provider for testing.
//!
//! Provides a configurable mock that returns predetermined outputs
//! for E2E loop testing without running real agent processes.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{AgentOutput, AgentProvider, ProposedFile, Stage};
use crate::session::SessionState;

/// A mock agent provider for testing.
///
/// Returns configurable responses and records the session state it saw.
#[derive(Debug, Clone)]
pub(crate) struct MockAgentProvider {
    /// Responses to return in order. Cycles if more invocations than responses.
    responses: Arc<Vec<MockResponse>>,
    /// Number of times `invoke` has been called.
    invocation_count: Arc<AtomicUsize>,
    /// Session state at each invocation.
    seen: Arc<Mutex<Vec<(Stage, SessionState)>>>,
}

/// A single mock response configuration.
#[derive(Debug, Clone)]
pub(crate) enum MockResponse {
    /// Return the given output.
    Output(AgentOutput),
    /// Return an error with the given message.
    Error(String),
    /// Never return.
    Hang,
}

impl MockAgentProvider {
    /// Create a new mock provider that returns the given responses in order.
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Arc::new(responses),
            invocation_count: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always writes the given files.
    pub fn writes(files: &[(&str, &str)]) -> Self {
        Self::new(vec![MockResponse::Output(AgentOutput {
            files: files
                .iter()
                .map(|(path, content)| ProposedFile::new(*path, *content))
                .collect(),
            state: serde_json::Map::new(),
        })])
    }

    /// Create a mock that always fails with the given error.
    pub fn always_fail(error: &str) -> Self {
        Self::new(vec![MockResponse::Error(error.to_string())])
    }

    /// Get the number of times `invoke` was called.
    pub fn invocation_count(&self) -> usize {
        self.invocation_count.load(Ordering::SeqCst)
    }

    /// Stage and session state of every invocation, in order.
    pub fn seen(&self) -> Vec<(Stage, SessionState)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProvider for MockAgentProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn invoke(&self, stage: Stage, state: &SessionState) -> Result<AgentOutput> {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((stage, state.clone()));

        match &self.responses[count % self.responses.len()] {
            MockResponse::Output(output) => Ok(output.clone()),
            MockResponse::Error(msg) => anyhow::bail!("{msg}"),
            MockResponse::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_writes() {
        let provider = MockAgentProvider::writes(&[("a.py", "x = 1\n")]);
        let output = provider
            .invoke(Stage::Generate, &SessionState::new())
            .await
            .unwrap();
        assert_eq!(output.files, vec![ProposedFile::new("a.py", "x = 1\n")]);
    }

    #[tokio::test]
    async fn test_mock_provider_error() {
        let provider = MockAgentProvider::always_fail("test error");
        let result = provider.invoke(Stage::Refactor, &SessionState::new()).await;
        assert!(result.unwrap_err().to_string().contains("test error"));
    }

    #[tokio::test]
    async fn test_mock_provider_cycles_and_records() {
        let provider = MockAgentProvider::new(vec![
            MockResponse::Output(AgentOutput::default()),
            MockResponse::Error("second".to_string()),
        ]);
        let state = SessionState::new();

        assert!(provider.invoke(Stage::Generate, &state).await.is_ok());
        assert!(provider.invoke(Stage::Refactor, &state).await.is_err());
        assert!(provider.invoke(Stage::Refactor, &state).await.is_ok());

        assert_eq!(provider.invocation_count(), 3);
        let stages: Vec<Stage> = provider.seen().into_iter().map(|(s, _)| s).collect();
        assert_eq!(stages, vec![Stage::Generate, Stage::Refactor, Stage::Refactor]);
    }
}
