//! Versioning snapshots
//!
//! A snapshot is a dated copy of the output tree taken immediately before
//! the first destructive write of a versioned run, named
//! `<ROOT_NAME><DDMMYYYYHHMM>` and created at most once per run. Prior
//! snapshots are recognized by that same pattern and never descended into.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::fs;
use thiserror::Error;
use tracing::debug;

use mirrorcast_pathsafe::is_snapshot_dir_name;
use mirrorcast_utils::ids::timestamp_digits;

/// Directory names never copied into a snapshot, compared
/// case-insensitively. Matches the walker's exclusion set.
const EXCLUDED_DIR_NAMES: &[&str] = &["venv", ".venv", "log"];

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot pivot is not a directory: {0}")]
    NotADirectory(Utf8PathBuf),
    #[error("snapshot pivot has no usable name: {0}")]
    UnnamedRoot(Utf8PathBuf),
    #[error("failed to copy {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Per-run snapshot gate.
///
/// Construct one per run; call [`Snapshotter::ensure`] before each write.
/// The copy happens on the first call only, and only when versioning is
/// enabled and the pivot exists.
#[derive(Debug)]
pub struct Snapshotter {
    root: Utf8PathBuf,
    enabled: bool,
    created: Option<Utf8PathBuf>,
}

impl Snapshotter {
    #[must_use]
    pub fn new(root: Utf8PathBuf, enabled: bool) -> Self {
        Self {
            root,
            enabled,
            created: None,
        }
    }

    /// The snapshot directory created by this run, if any.
    #[must_use]
    pub fn created(&self) -> Option<&Utf8Path> {
        self.created.as_deref()
    }

    /// Take the snapshot if one is due. Returns the snapshot directory when
    /// a snapshot exists for this run (whether created now or earlier).
    ///
    /// # Errors
    ///
    /// Fails if the pivot cannot be read or the copy fails partway; a
    /// partial snapshot directory may remain and is recognized as a
    /// snapshot by later walks.
    pub fn ensure(&mut self) -> Result<Option<&Utf8Path>, SnapshotError> {
        if !self.enabled {
            return Ok(None);
        }
        if self.created.is_some() {
            return Ok(self.created.as_deref());
        }
        // Nothing to preserve when the output root does not exist yet.
        if !self.root.exists() {
            return Ok(None);
        }
        if !self.root.is_dir() {
            return Err(SnapshotError::NotADirectory(self.root.clone()));
        }

        let root_name = self
            .root
            .file_name()
            .ok_or_else(|| SnapshotError::UnnamedRoot(self.root.clone()))?
            .to_string();
        let snapshot_dir = self
            .root
            .join(format!("{root_name}{}", timestamp_digits(Local::now())));

        debug!(snapshot = %snapshot_dir, "creating versioning snapshot");
        copy_tree(&self.root, &snapshot_dir, &root_name)?;

        self.created = Some(snapshot_dir);
        Ok(self.created.as_deref())
    }
}

fn copy_tree(src: &Utf8Path, dst: &Utf8Path, root_name: &str) -> Result<(), SnapshotError> {
    fs::create_dir_all(dst.as_std_path()).map_err(|source| SnapshotError::Io {
        path: dst.to_path_buf(),
        source,
    })?;

    let entries = fs::read_dir(src.as_std_path()).map_err(|source| SnapshotError::Io {
        path: src.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| SnapshotError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        let from = src.join(&name);
        let to = dst.join(&name);

        if from.is_dir() {
            if EXCLUDED_DIR_NAMES
                .iter()
                .any(|excluded| name.eq_ignore_ascii_case(excluded))
            {
                continue;
            }
            if is_snapshot_dir_name(root_name, &name) {
                continue;
            }
            copy_tree(&from, &to, root_name)?;
        } else if from.is_file() {
            fs::copy(from.as_std_path(), to.as_std_path()).map_err(|source| {
                SnapshotError::Io {
                    path: from.clone(),
                    source,
                }
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn touch(root: &Utf8Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        fs::write(path.as_std_path(), content).unwrap();
    }

    #[test]
    fn test_disabled_snapshotter_never_copies() {
        let dir = TempDir::new().unwrap();
        let root = utf8_root(&dir);
        touch(&root, "a.txt", "a");

        let mut snap = Snapshotter::new(root.clone(), false);
        assert!(snap.ensure().unwrap().is_none());
        assert_eq!(fs::read_dir(root.as_std_path()).unwrap().count(), 1);
    }

    #[test]
    fn test_snapshot_copies_existing_tree_once() {
        let dir = TempDir::new().unwrap();
        let root = utf8_root(&dir);
        touch(&root, "a.txt", "old");
        touch(&root, "sub/b.txt", "deep");

        let mut snap = Snapshotter::new(root.clone(), true);
        let first = snap.ensure().unwrap().unwrap().to_path_buf();
        assert!(first.join("a.txt").is_file());
        assert!(first.join("sub/b.txt").is_file());
        assert_eq!(
            fs::read_to_string(first.join("a.txt").as_std_path()).unwrap(),
            "old"
        );

        // A second call returns the same directory and copies nothing new.
        touch(&root, "c.txt", "new");
        let second = snap.ensure().unwrap().unwrap().to_path_buf();
        assert_eq!(first, second);
        assert!(!second.join("c.txt").exists());
    }

    #[test]
    fn test_snapshot_excludes_log_venv_and_prior_snapshots() {
        let dir = TempDir::new().unwrap();
        let root = utf8_root(&dir);
        let root_name = root.file_name().unwrap().to_string();
        touch(&root, "keep.txt", "k");
        touch(&root, "LOG/events.jsonl", "x");
        touch(&root, "venv/lib.py", "x");
        touch(&root, &format!("{root_name}010120250000/old.txt"), "x");

        let mut snap = Snapshotter::new(root.clone(), true);
        let created = snap.ensure().unwrap().unwrap().to_path_buf();
        assert!(created.join("keep.txt").is_file());
        assert!(!created.join("LOG").exists());
        assert!(!created.join("venv").exists());
        assert!(!created.join(format!("{root_name}010120250000")).exists());
    }

    #[test]
    fn test_missing_root_snapshots_nothing() {
        let dir = TempDir::new().unwrap();
        let root = utf8_root(&dir).join("not-yet");
        let mut snap = Snapshotter::new(root, true);
        assert!(snap.ensure().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_name_matches_pattern() {
        let dir = TempDir::new().unwrap();
        let root = utf8_root(&dir);
        touch(&root, "a.txt", "a");
        let root_name = root.file_name().unwrap().to_string();

        let mut snap = Snapshotter::new(root.clone(), true);
        let created = snap.ensure().unwrap().unwrap().to_path_buf();
        let name = created.file_name().unwrap();
        assert!(is_snapshot_dir_name(&root_name, name));
    }
}
