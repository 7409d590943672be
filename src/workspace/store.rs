//! Read/write/list operations confined to the project root.
//!
//! The store performs no locking. Within a run the refinement loop is the
//! only caller, and runs sharing a root must be serialized by whoever
//! starts them.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use super::{FileError, FileSnapshot, ProjectRoot};

/// Directory names never captured when a whole directory is snapshotted.
const SNAPSHOT_EXCLUDES: &[&str] = &[".git", ".refinery", "__pycache__", ".pytest_cache"];

/// File access layer for one project root.
#[derive(Debug, Clone)]
pub(crate) struct FileStore {
    root: ProjectRoot,
}

impl FileStore {
    /// Creates a store over an existing root.
    pub fn new(root: ProjectRoot) -> Self {
        Self { root }
    }

    /// Opens a store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FileError> {
        Ok(Self::new(ProjectRoot::new(path)?))
    }

    /// The confinement boundary.
    pub fn root(&self) -> &ProjectRoot {
        &self.root
    }

    /// Reads a file's bytes.
    pub fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, FileError> {
        let path = path.as_ref();
        let resolved = self.root.resolve(path)?;
        if resolved.is_dir() {
            return Err(FileError::is_directory(path));
        }
        fs::read(&resolved).map_err(|e| FileError::from_io(path, e))
    }

    /// Returns true if `path` exists under the root.
    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool, FileError> {
        let resolved = self.root.resolve(path)?;
        Ok(resolved.symlink_metadata().is_ok())
    }

    /// Writes `contents` to `path`, creating parent directories.
    ///
    /// Fails with `AlreadyExists` when the file exists and `overwrite` is
    /// false. The no-overwrite case uses `create_new`, so a concurrent
    /// creator cannot be clobbered either.
    pub fn write(
        &self,
        path: impl AsRef<Path>,
        contents: &[u8],
        overwrite: bool,
    ) -> Result<(), FileError> {
        let path = path.as_ref();
        let resolved = self.root.resolve(path)?;

        if resolved.is_dir() {
            return Err(FileError::is_directory(path));
        }
        if !overwrite && resolved.symlink_metadata().is_ok() {
            return Err(FileError::already_exists(path));
        }

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).map_err(|e| FileError::from_io(path, e))?;
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut file = options
            .open(&resolved)
            .map_err(|e| FileError::from_io(path, e))?;
        file.write_all(contents)
            .map_err(|e| FileError::from_io(path, e))?;

        debug!("Wrote {} bytes to {}", contents.len(), path.display());
        Ok(())
    }

    /// Lists a directory. Entries are relative to the listed directory and
    /// come back in sorted, depth-first order.
    pub fn list(&self, path: impl AsRef<Path>, recursive: bool) -> Result<Vec<PathBuf>, FileError> {
        let path = path.as_ref();
        let resolved = self.root.resolve(path)?;
        let metadata = fs::metadata(&resolved).map_err(|e| FileError::from_io(path, e))?;
        if !metadata.is_dir() {
            return Err(FileError::not_a_directory(path));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        for entry in WalkDir::new(&resolved)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| walk_error(path, e))?;
            if let Ok(relative) = entry.path().strip_prefix(&resolved) {
                entries.push(relative.to_path_buf());
            }
        }
        Ok(entries)
    }

    /// Captures the named files for a sandbox run.
    ///
    /// A named directory contributes every file beneath it, minus caches
    /// and VCS metadata. Snapshot paths are normalized and root-relative.
    pub fn snapshot<I, P>(&self, paths: I) -> Result<FileSnapshot, FileError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut snapshot = FileSnapshot::new();

        for path in paths {
            let path = path.as_ref();
            let resolved = self.root.resolve(path)?;
            let relative = self
                .root
                .relative_of(&resolved)
                .unwrap_or_else(|| path.to_path_buf());

            if !resolved.is_dir() {
                let contents = self.read(&relative)?;
                snapshot.insert(relative, contents);
                continue;
            }

            let walker = WalkDir::new(&resolved)
                .min_depth(1)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| !is_excluded(entry));

            for entry in walker {
                let entry = entry.map_err(|e| walk_error(path, e))?;
                if entry.file_type().is_dir() || entry.path().is_dir() {
                    continue;
                }
                let Ok(inner) = entry.path().strip_prefix(&resolved) else {
                    continue;
                };
                let file = relative.join(inner);
                let contents = self.read(&file)?;
                snapshot.insert(file, contents);
            }
        }

        debug!(
            "Captured snapshot: {} files, {} bytes",
            snapshot.len(),
            snapshot.total_bytes()
        );
        Ok(snapshot)
    }
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SNAPSHOT_EXCLUDES.contains(&name))
}

fn walk_error(path: &Path, err: walkdir::Error) -> FileError {
    let message = err.to_string();
    match err.into_io_error() {
        Some(source) => FileError::from_io(path, source),
        None => FileError::Io {
            path: path.display().to_string(),
            source: io::Error::other(message),
        },
    }
}
