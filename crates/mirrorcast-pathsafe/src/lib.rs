//! Path safety and the mirror walker
//!
//! Two jobs live here. First, the path rules every model-supplied output
//! path must satisfy before a single byte is written: relative, no parent
//! traversal, no backslashes, and a normalized result that stays inside the
//! target root. Second, the recursive walk of an input tree that feeds the
//! mirror uploader: depth-first, deterministically ordered, with the
//! exclusion rules (`venv`, `.venv`, `LOG`, prior snapshots, escaping
//! symlinks, deny globs) applied during descent.

mod walker;

pub use walker::{WalkSkip, WalkedFile, WalkerError, WalkerPolicy, walk};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// A path that violates the output-path safety rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathPolicyError {
    #[error("path is empty")]
    Empty,
    #[error("path must be relative: {path}")]
    Absolute { path: String },
    #[error("path contains a parent-traversal segment: {path}")]
    ParentTraversal { path: String },
    #[error("path contains a backslash: {path}")]
    Backslash { path: String },
    #[error("path escapes the target root: {path}")]
    EscapesRoot { path: String },
}

/// Validate a model-supplied relative path without touching the filesystem.
///
/// Rules: non-empty, posix separators only, not absolute, no leading
/// separator, and no `.`/`..` segments.
///
/// # Errors
///
/// Returns the first violated rule.
pub fn validate_rel_path(rel: &str) -> Result<(), PathPolicyError> {
    if rel.is_empty() {
        return Err(PathPolicyError::Empty);
    }
    if rel.contains('\\') {
        return Err(PathPolicyError::Backslash {
            path: rel.to_string(),
        });
    }
    if rel.starts_with('/') {
        return Err(PathPolicyError::Absolute {
            path: rel.to_string(),
        });
    }
    // Windows drive or UNC forms are absolute even without a leading slash.
    if rel.len() >= 2 && rel.as_bytes()[1] == b':' && rel.as_bytes()[0].is_ascii_alphabetic() {
        return Err(PathPolicyError::Absolute {
            path: rel.to_string(),
        });
    }
    for segment in rel.split('/') {
        if segment == ".." || segment == "." {
            return Err(PathPolicyError::ParentTraversal {
                path: rel.to_string(),
            });
        }
        if segment.is_empty() {
            // "a//b" normalizes ambiguously; reject outright.
            return Err(PathPolicyError::EscapesRoot {
                path: rel.to_string(),
            });
        }
    }
    Ok(())
}

/// Join a validated relative path onto a root, rejecting anything that
/// would resolve outside it.
///
/// # Errors
///
/// Returns a [`PathPolicyError`] if the relative path fails
/// [`validate_rel_path`] or the joined result does not remain under `root`.
pub fn safe_join(root: &Utf8Path, rel: &str) -> Result<Utf8PathBuf, PathPolicyError> {
    validate_rel_path(rel)?;

    let joined = root.join(rel);
    // validate_rel_path already bans `..`, so a lexical prefix check is
    // sufficient; no filesystem access, the target may not exist yet.
    if !joined.starts_with(root) {
        return Err(PathPolicyError::EscapesRoot {
            path: rel.to_string(),
        });
    }
    Ok(joined)
}

/// Whether a directory name matches the versioning-snapshot pattern for the
/// given root: the root's base name followed by exactly twelve digits.
#[must_use]
pub fn is_snapshot_dir_name(root_name: &str, candidate: &str) -> bool {
    if candidate.len() != root_name.len() + 12 {
        return false;
    }
    let (prefix, digits) = candidate.split_at(root_name.len());
    prefix.eq_ignore_ascii_case(root_name) && digits.chars().all(|c| c.is_ascii_digit())
}
