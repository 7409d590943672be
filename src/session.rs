//! Session state shared between collaborators and the refinement loop.
//!
//! The loop only reads and writes typed values under well-known keys.
//! Persistence is the caller's business; `SessionRecord` is what the CLI
//! writes to `.refinery/session.json`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Location of the persisted session, relative to the project root.
pub(crate) const SESSION_FILE: &str = ".refinery/session.json";

/// Well-known session keys.
pub(crate) mod keys {
    /// Original natural-language request.
    pub const USER_REQUIREMENT: &str = "user_requirement";
    /// Project root the run operates on.
    pub const CODEBASE_PATH: &str = "codebase_path";
    /// Structured breakdown of the requirement.
    pub const REQUIREMENT_DETAILS: &str = "requirement_details";
    /// Summary of the existing codebase.
    pub const CODE_CONTEXT: &str = "code_context";
    /// Plan produced before generation.
    pub const IMPLEMENTATION_PLAN: &str = "implementation_plan";
    /// Files produced by generation, relative to the project root.
    pub const GENERATED_CODE_PATHS: &str = "generated_code_paths";
    /// Test files to run, relative to the project root.
    pub const TEST_PATHS: &str = "test_paths";
    /// Last `TestOutcome`.
    pub const TEST_RESULTS: &str = "test_results";
    /// Files touched by the last refactor.
    pub const REFACTORED_CODE_PATHS: &str = "refactored_code_paths";
    /// Current refinement attempt (0-based).
    pub const REFACTOR_ATTEMPT: &str = "refactor_attempt";
    /// Outcome of committing the generated files.
    pub const VERSIONING_SUMMARY: &str = "versioning_summary";
}

/// A string-keyed map of JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct SessionState {
    values: Map<String, Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a typed value. Missing keys yield `Ok(None)`; a value of the
    /// wrong shape is an error.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .filter(|value| !value.is_null())
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("Session key '{key}' has an unexpected shape"))
            })
            .transpose()
    }

    /// Stores a typed value, replacing any previous one.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize session key '{key}'"))?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Applies updates from a collaborator. Later values win.
    pub fn merge(&mut self, updates: Map<String, Value>) {
        self.values.extend(updates);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// A persisted session plus how the run that produced it ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SessionRecord {
    pub saved_at: DateTime<Utc>,
    /// Terminal state of the run, if it finished.
    pub termination: Option<String>,
    pub attempts: u32,
    pub state: SessionState,
}

impl SessionRecord {
    pub fn new(state: SessionState, termination: Option<String>, attempts: u32) -> Self {
        Self {
            saved_at: Utc::now(),
            termination,
            attempts,
            state,
        }
    }

    /// Load the record if it exists
    pub fn load(project_dir: &Path) -> Result<Option<Self>> {
        let path = project_dir.join(SESSION_FILE);

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;

        let record: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))?;

        Ok(Some(record))
    }

    /// Save the record, creating `.refinery/` if needed
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let path = project_dir.join(SESSION_FILE);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize session")?;

        fs::write(&path, content)
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;

        Ok(())
    }

    /// Delete the record. Returns whether one existed.
    pub fn delete(project_dir: &Path) -> Result<bool> {
        let path = project_dir.join(SESSION_FILE);

        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete session file: {}", path.display()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
