//! Point-in-time copy of project files handed to a sandbox.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// An ordered set of `(relative path, bytes)` pairs.
///
/// Paths are already validated and normalized by the `FileStore` that
/// produced them. The snapshot is owned by a single execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FileSnapshot {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl FileSnapshot {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file.
    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: Vec<u8>) {
        self.files.insert(path.into(), contents);
    }

    /// Iterates files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &[u8])> {
        self.files
            .iter()
            .map(|(path, contents)| (path.as_path(), contents.as_slice()))
    }

    /// Returns true if the snapshot contains `path`.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.files.contains_key(path.as_ref())
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no files were captured.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total payload size in bytes.
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}
