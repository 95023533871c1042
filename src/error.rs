//! Error taxonomy for the merge and unmerge engines.

use std::io;

use thiserror::Error;

use crate::contents::ManifestError;
use crate::protect::PatternError;

/// A merge operation failed. All variants abort the whole merge.
#[derive(Error, Debug)]
pub enum MergeError {
    /// The destination holds an object of an incompatible kind and
    /// force-replacement was not enabled.
    #[error("cannot overwrite {found} '{path}' with {wanted}")]
    Conflict {
        /// Root-relative destination path.
        path: String,
        /// What is currently at the destination.
        found: &'static str,
        /// What the image wants to install there.
        wanted: &'static str,
    },
    /// A destination directory would have to be removed but is not empty.
    /// Non-empty directories are never deleted, force-replacement or not.
    #[error("cannot replace non-empty directory '{path}'")]
    NotEmpty {
        /// Root-relative destination path.
        path: String,
    },
    /// An image symlink points back into the image and rewriting is off.
    #[error("symlink '{path}' points into the image ('{target}') and symlink rewriting is not enabled")]
    ImageSymlink {
        /// Root-relative symlink path.
        path: String,
        /// The offending target string.
        target: String,
    },
    /// An image entry has a name that is not valid UTF-8, which the contents
    /// manifest cannot represent faithfully.
    #[error("image entry '{path}' has a non-unicode name")]
    NonUnicodeName {
        /// The offending source path, rendered lossily.
        path: String,
    },
    /// The image or root directory is missing or not a directory.
    #[error("'{path}' is not a usable {role} directory")]
    BadTree {
        /// The path given.
        path: String,
        /// Either "image" or "root".
        role: &'static str,
    },
    /// A protect or mask pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// Writing the contents manifest failed.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A filesystem operation failed.
    #[error("cannot {op} '{path}': {source}")]
    Io {
        /// The operation that failed, e.g. "create directory".
        op: &'static str,
        /// The path it failed on.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl MergeError {
    /// Wrap an I/O failure with the operation and path it occurred on.
    #[must_use]
    pub fn io(op: &'static str, path: &std::path::Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

/// An unmerge operation failed outright.
///
/// Skipped entries are not errors; they are diagnostics reflected in the
/// exit-status bitset. These variants cover the cases where continuing makes
/// no sense.
#[derive(Error, Debug)]
pub enum UnmergeError {
    /// The root directory is missing or not a directory.
    #[error("'{path}' is not a usable root directory")]
    BadRoot {
        /// The path given.
        path: String,
    },
    /// A protect or mask pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// The contents manifest could not be read.
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A deletion failed.
    #[error("cannot {op} '{path}': {source}")]
    Io {
        /// The operation that failed, e.g. "unlink".
        op: &'static str,
        /// The path it failed on.
        path: String,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl UnmergeError {
    /// Wrap an I/O failure with the operation and path it occurred on.
    #[must_use]
    pub fn io(op: &'static str, path: &std::path::Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn conflict_names_both_kinds() {
        let err = MergeError::Conflict {
            path: "/etc/foo".to_string(),
            found: "directory",
            wanted: "file",
        };
        assert_eq!(
            err.to_string(),
            "cannot overwrite directory '/etc/foo' with file"
        );
    }

    #[test]
    fn io_wrapper_carries_op_and_path() {
        let err = MergeError::io(
            "create directory",
            std::path::Path::new("/root/x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("create directory"));
        assert!(text.contains("/root/x"));
    }

    #[test]
    fn pattern_errors_convert() {
        let bad = crate::protect::ProtectionPolicy::new(&["[".to_string()], &[]).unwrap_err();
        let err: UnmergeError = bad.into();
        assert!(matches!(err, UnmergeError::Pattern(_)));
    }
}
