//! Recursive input-tree walker
//!
//! Depth-first, entries sorted by name so two walks of the same tree agree
//! byte-for-byte. Exclusions happen during descent: named directories
//! (`venv`, `.venv`, `LOG`, case-insensitive), prior versioning snapshots,
//! symlinks that resolve outside the root, and configured deny globs.
//! Files that survive descent are then judged by the upload policy (size
//! cap, extension allow/deny); ineligible files are still reported, with a
//! skip reason, so the manifest can account for every path seen.

use camino::{Utf8Path, Utf8PathBuf};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use thiserror::Error;

use crate::is_snapshot_dir_name;

/// Directory names excluded from every walk, compared case-insensitively.
const EXCLUDED_DIR_NAMES: &[&str] = &["venv", ".venv", "log"];

/// Upload eligibility policy applied to each file the walk reaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerPolicy {
    /// Per-file size cap in bytes.
    pub max_file_bytes: u64,
    /// If non-empty, only these extensions (without dot, case-insensitive)
    /// are eligible.
    #[serde(default)]
    pub allow_extensions: Vec<String>,
    /// Extensions always skipped, evaluated before the allow list.
    #[serde(default)]
    pub deny_extensions: Vec<String>,
    /// Glob patterns (relative-path form) excluded from the walk entirely.
    #[serde(default)]
    pub deny_globs: Vec<String>,
}

impl Default for WalkerPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: 2 * 1024 * 1024,
            allow_extensions: Vec::new(),
            deny_extensions: vec!["exe".to_string(), "dll".to_string(), "so".to_string()],
            deny_globs: Vec::new(),
        }
    }
}

/// Why a file the walk reached is not eligible for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkSkip {
    TooLarge { size: u64 },
    ExtensionDenied,
    ExtensionNotAllowed,
}

impl WalkSkip {
    /// Manifest-facing reason string.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::TooLarge { size } => format!("too_large:{size}"),
            Self::ExtensionDenied => "extension_denied".to_string(),
            Self::ExtensionNotAllowed => "extension_not_allowed".to_string(),
        }
    }
}

/// One file the walk reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub abs_path: Utf8PathBuf,
    /// Posix-style path relative to the walk root.
    pub rel_path: String,
    pub size: u64,
    /// Present for eligible files only; skipped files are not hashed.
    pub sha256: Option<String>,
    pub skip: Option<WalkSkip>,
}

#[derive(Debug, Error)]
pub enum WalkerError {
    #[error("walk root is not a directory: {0}")]
    NotADirectory(Utf8PathBuf),
    #[error("walk root has no usable name: {0}")]
    UnnamedRoot(Utf8PathBuf),
    #[error("invalid deny glob '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Walk `root` depth-first and return every file reached, in lexical order
/// of relative path, with upload eligibility decided by `policy`.
///
/// # Errors
///
/// Fails if the root is not a directory, a deny glob does not compile, or
/// directory enumeration fails. Unreadable individual files fail the walk
/// too; partial mirrors are worse than loud errors here.
pub fn walk(root: &Utf8Path, policy: &WalkerPolicy) -> Result<Vec<WalkedFile>, WalkerError> {
    if !root.is_dir() {
        return Err(WalkerError::NotADirectory(root.to_path_buf()));
    }
    let root_name = root
        .file_name()
        .ok_or_else(|| WalkerError::UnnamedRoot(root.to_path_buf()))?
        .to_string();

    let deny_globs = build_globset(&policy.deny_globs)?;

    let mut out = Vec::new();
    walk_dir(root, root, &root_name, policy, &deny_globs, &mut out)?;
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, WalkerError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| WalkerError::InvalidGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| WalkerError::InvalidGlob {
        pattern: "<combined>".to_string(),
        source,
    })
}

fn walk_dir(
    root: &Utf8Path,
    dir: &Utf8Path,
    root_name: &str,
    policy: &WalkerPolicy,
    deny_globs: &GlobSet,
    out: &mut Vec<WalkedFile>,
) -> Result<(), WalkerError> {
    let mut entries: Vec<_> = fs::read_dir(dir.as_std_path())
        .map_err(|source| WalkerError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .collect::<Result<_, _>>()
        .map_err(|source| WalkerError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let abs = dir.join(&name);
        let rel = abs
            .strip_prefix(root)
            .map(|p| p.as_str().replace('\\', "/"))
            .unwrap_or_else(|_| name.clone());

        let file_type = entry.file_type().map_err(|source| WalkerError::Io {
            path: abs.clone(),
            source,
        })?;

        if file_type.is_symlink() {
            if !symlink_stays_inside(root, &abs) {
                continue;
            }
            // In-root symlinks are followed like their targets.
        }

        if abs.is_dir() {
            if EXCLUDED_DIR_NAMES
                .iter()
                .any(|excluded| name.eq_ignore_ascii_case(excluded))
            {
                continue;
            }
            if is_snapshot_dir_name(root_name, &name) {
                continue;
            }
            if deny_globs.is_match(&rel) {
                continue;
            }
            walk_dir(root, &abs, root_name, policy, deny_globs, out)?;
        } else if abs.is_file() {
            if deny_globs.is_match(&rel) {
                continue;
            }
            let metadata = fs::metadata(abs.as_std_path()).map_err(|source| WalkerError::Io {
                path: abs.clone(),
                source,
            })?;
            let size = metadata.len();
            let skip = judge(policy, &name, size);
            let sha256 = if skip.is_none() {
                Some(hash_file(&abs)?)
            } else {
                None
            };
            out.push(WalkedFile {
                abs_path: abs,
                rel_path: rel,
                size,
                sha256,
                skip,
            });
        }
    }
    Ok(())
}

fn judge(policy: &WalkerPolicy, name: &str, size: u64) -> Option<WalkSkip> {
    if size > policy.max_file_bytes {
        return Some(WalkSkip::TooLarge { size });
    }
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    if let Some(ext) = &ext {
        if policy
            .deny_extensions
            .iter()
            .any(|denied| denied.trim_start_matches('.').eq_ignore_ascii_case(ext))
        {
            return Some(WalkSkip::ExtensionDenied);
        }
    }
    if !policy.allow_extensions.is_empty() {
        let allowed = ext.as_ref().is_some_and(|ext| {
            policy
                .allow_extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
        });
        if !allowed {
            return Some(WalkSkip::ExtensionNotAllowed);
        }
    }
    None
}

fn symlink_stays_inside(root: &Utf8Path, link: &Utf8Path) -> bool {
    let Ok(canonical_root) = root.as_std_path().canonicalize() else {
        return false;
    };
    match link.as_std_path().canonicalize() {
        Ok(target) => target.starts_with(&canonical_root),
        Err(_) => false, // dangling links are excluded
    }
}

fn hash_file(path: &Utf8Path) -> Result<String, WalkerError> {
    let content = fs::read(path.as_std_path()).map_err(|source| WalkerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}
