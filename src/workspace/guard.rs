//! Path confinement for the project tree.
//!
//! Every caller-supplied path is relative to a canonical project root.
//! Resolution is lexical first (no `..`, no absolute paths), then the
//! real path of the deepest existing ancestor is checked so a symlink
//! inside the tree cannot point the operation somewhere else.

use std::path::{Component, Path, PathBuf};

use super::FileError;

/// An absolute, canonical filesystem boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProjectRoot {
    path: PathBuf,
}

impl ProjectRoot {
    /// Canonicalizes `path` and uses it as the boundary.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, FileError> {
        let path = path.as_ref();
        let canonical = path
            .canonicalize()
            .map_err(|e| FileError::from_io(path, e))?;
        if !canonical.is_dir() {
            return Err(FileError::not_a_directory(path));
        }
        Ok(Self { path: canonical })
    }

    /// The canonical root path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves a caller-supplied relative path to an absolute path under
    /// the root, or fails with `PathEscape`.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf, FileError> {
        let relative = relative.as_ref();
        let normalized =
            normalize(relative).map_err(|reason| FileError::path_escape(relative, reason))?;
        if normalized.as_os_str().is_empty() {
            return Ok(self.path.clone());
        }
        let joined = self.path.join(&normalized);
        self.verify_real_path(relative, &joined)?;
        Ok(joined)
    }

    /// Converts an absolute path under the root back into a root-relative one.
    pub fn relative_of(&self, absolute: &Path) -> Option<PathBuf> {
        absolute
            .strip_prefix(&self.path)
            .ok()
            .map(Path::to_path_buf)
    }

    /// Checks that the deepest existing ancestor of `joined` (the path
    /// itself when it exists) really lives under the root.
    fn verify_real_path(&self, relative: &Path, joined: &Path) -> Result<(), FileError> {
        for ancestor in joined.ancestors() {
            if ancestor.symlink_metadata().is_err() {
                continue;
            }
            let real = ancestor
                .canonicalize()
                .map_err(|_| FileError::path_escape(relative, "unresolvable symlink"))?;
            if !real.starts_with(&self.path) {
                return Err(FileError::path_escape(relative, "symlink leaves project root"));
            }
            return Ok(());
        }
        Err(FileError::path_escape(relative, "no existing ancestor"))
    }
}

/// Lexically normalizes a relative path.
///
/// `.` segments are dropped; the root itself normalizes to an empty path.
pub(crate) fn normalize(relative: &Path) -> Result<PathBuf, &'static str> {
    if relative.as_os_str().is_empty() {
        return Err("empty path");
    }
    if relative.as_os_str().to_string_lossy().contains('\0') {
        return Err("NUL byte in path");
    }

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("parent traversal"),
            Component::RootDir | Component::Prefix(_) => return Err("absolute path"),
        }
    }
    Ok(normalized)
}
