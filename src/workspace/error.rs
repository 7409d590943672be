//! Domain-specific error types for project file access.
//!
//! Every file operation funnels through these variants so callers can
//! distinguish a confinement violation from an ordinary I/O failure.

use std::io;
use std::path::Path;

/// Errors that can occur while accessing the project tree.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FileError {
    /// The path would resolve outside the project root.
    #[error("Path escapes project root: {path} ({reason})")]
    PathEscape { path: String, reason: &'static str },

    /// The path does not exist.
    #[error("File not found: {path}")]
    NotFound { path: String },

    /// The file exists and overwriting was not requested.
    #[error("File already exists and overwrite is false: {path}")]
    AlreadyExists { path: String },

    /// The OS refused access.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    /// A file operation was attempted on a directory.
    #[error("Path is a directory: {path}")]
    IsDirectory { path: String },

    /// A directory operation was attempted on a file.
    #[error("Path is not a directory: {path}")]
    NotADirectory { path: String },

    /// Any other I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    /// Creates a `PathEscape` error.
    pub fn path_escape(path: impl AsRef<Path>, reason: &'static str) -> Self {
        Self::PathEscape {
            path: display(path),
            reason,
        }
    }

    /// Creates an `AlreadyExists` error.
    pub fn already_exists(path: impl AsRef<Path>) -> Self {
        Self::AlreadyExists {
            path: display(path),
        }
    }

    /// Creates an `IsDirectory` error.
    pub fn is_directory(path: impl AsRef<Path>) -> Self {
        Self::IsDirectory {
            path: display(path),
        }
    }

    /// Creates a `NotADirectory` error.
    pub fn not_a_directory(path: impl AsRef<Path>) -> Self {
        Self::NotADirectory {
            path: display(path),
        }
    }

    /// Maps an `io::Error` onto the matching variant, keyed by the
    /// caller-facing relative path.
    pub fn from_io(path: impl AsRef<Path>, source: io::Error) -> Self {
        let path = display(path);
        match source.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Io { path, source },
        }
    }

    /// Returns true if this is a confinement violation.
    pub fn is_path_escape(&self) -> bool {
        matches!(self, Self::PathEscape { .. })
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn display(path: impl AsRef<Path>) -> String {
    path.as_ref().display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_escape_error() {
        let err = FileError::path_escape("../etc/passwd", "parent traversal");
        assert!(err.is_path_escape());
        assert_eq!(
            err.to_string(),
            "Path escapes project root: ../etc/passwd (parent traversal)"
        );
    }

    #[test]
    fn test_from_io_maps_kinds() {
        let err = FileError::from_io("a.txt", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());

        let err = FileError::from_io("a.txt", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, FileError::PermissionDenied { .. }));

        let err = FileError::from_io("a.txt", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(matches!(err, FileError::AlreadyExists { .. }));

        let err = FileError::from_io("a.txt", io::Error::other("disk on fire"));
        assert!(matches!(err, FileError::Io { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let escape = FileError::path_escape("/abs", "absolute path");
        let missing = FileError::from_io("x", io::Error::from(io::ErrorKind::NotFound));
        let exists = FileError::already_exists("y");

        assert!(escape.is_path_escape());
        assert!(!escape.is_not_found());
        assert!(!missing.is_path_escape());
        assert!(missing.is_not_found());
        assert!(matches!(exists, FileError::AlreadyExists { .. }));
        assert!(!exists.is_not_found());
    }
}
