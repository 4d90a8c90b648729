//! Output tree writer
//!
//! The single place that writes model-produced files. Every path passes
//! the safety rules, the versioning snapshot fires before the first
//! destructive write, whole files are replaced atomically, and rejected
//! or unparseable responses are quarantined under `_invalid/` instead of
//! being written.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use mirrorcast_pathsafe::safe_join;
use mirrorcast_snapshot::Snapshotter;
use mirrorcast_utils::atomic_write::write_bytes_atomic;
use mirrorcast_utils::ids::StepKey;

use crate::error::RunError;

/// Directory (under the output root) holding quarantined raw responses.
const INVALID_DIR: &str = "_invalid";

pub struct OutputWriter {
    out_root: Utf8PathBuf,
    snapshotter: Snapshotter,
}

impl OutputWriter {
    #[must_use]
    pub fn new(out_root: Utf8PathBuf, versioning: bool) -> Self {
        let snapshotter = Snapshotter::new(out_root.clone(), versioning);
        Self {
            out_root,
            snapshotter,
        }
    }

    /// The output root this writer is scoped to.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.out_root
    }

    /// Whether this run created a snapshot (and where).
    #[must_use]
    pub fn snapshot_created(&self) -> Option<&Utf8Path> {
        self.snapshotter.created()
    }

    /// Write one whole output file, snapshotting first when due.
    ///
    /// # Errors
    ///
    /// Rejects unsafe paths with [`RunError::PathPolicy`]; disk failures
    /// surface as [`RunError::Storage`].
    pub fn write_file(&mut self, rel_path: &str, content: &[u8]) -> Result<(), RunError> {
        let target = safe_join(&self.out_root, rel_path)?;
        self.snapshotter
            .ensure()
            .map_err(|e| RunError::Storage(e.to_string()))?;
        write_bytes_atomic(&target, content).map_err(|e| RunError::Storage(e.to_string()))?;
        debug!(path = rel_path, bytes = content.len(), "wrote output file");
        Ok(())
    }

    /// Remove one output file (MODIFY delete actions), snapshotting first.
    ///
    /// # Errors
    ///
    /// Same policy as [`OutputWriter::write_file`]; a missing target is
    /// not an error.
    pub fn delete_file(&mut self, rel_path: &str) -> Result<(), RunError> {
        let target = safe_join(&self.out_root, rel_path)?;
        if !target.exists() {
            return Ok(());
        }
        self.snapshotter
            .ensure()
            .map_err(|e| RunError::Storage(e.to_string()))?;
        std::fs::remove_file(target.as_std_path())
            .map_err(|e| RunError::Storage(e.to_string()))?;
        debug!(path = rel_path, "deleted output file");
        Ok(())
    }

    /// Quarantine a raw response that failed its contract. Quarantine
    /// never snapshots; it records evidence, not output.
    pub fn quarantine(&self, step: &StepKey, raw: &str) {
        let target = self
            .out_root
            .join(INVALID_DIR)
            .join(format!("{step}.json"));
        if let Err(e) = write_bytes_atomic(&target, raw.as_bytes()) {
            tracing::warn!(step = %step, error = %e, "failed to quarantine response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn out_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("OUT")).unwrap()
    }

    #[test]
    fn test_write_creates_nested_file() {
        let dir = TempDir::new().unwrap();
        let mut writer = OutputWriter::new(out_root(&dir), false);

        writer.write_file("src/main.py", b"print('hi')\n").unwrap();
        let written =
            std::fs::read(out_root(&dir).join("src/main.py").as_std_path()).unwrap();
        assert_eq!(written, b"print('hi')\n");
    }

    #[test]
    fn test_unsafe_paths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = OutputWriter::new(out_root(&dir), false);

        assert!(matches!(
            writer.write_file("../escape.py", b"x"),
            Err(RunError::PathPolicy(_))
        ));
        assert!(matches!(
            writer.write_file("a\\b.py", b"x"),
            Err(RunError::PathPolicy(_))
        ));
    }

    #[test]
    fn test_versioned_write_snapshots_prior_state_once() {
        let dir = TempDir::new().unwrap();
        let root = out_root(&dir);
        std::fs::create_dir_all(root.as_std_path()).unwrap();
        std::fs::write(root.join("old.txt").as_std_path(), "before").unwrap();

        let mut writer = OutputWriter::new(root.clone(), true);
        writer.write_file("old.txt", b"after").unwrap();
        writer.write_file("new.txt", b"fresh").unwrap();

        let snapshot = writer.snapshot_created().unwrap().to_path_buf();
        assert_eq!(
            std::fs::read_to_string(snapshot.join("old.txt").as_std_path()).unwrap(),
            "before"
        );
        // The second write did not re-snapshot; new.txt is absent there.
        assert!(!snapshot.join("new.txt").exists());
        // The live tree has the new content.
        assert_eq!(
            std::fs::read_to_string(root.join("old.txt").as_std_path()).unwrap(),
            "after"
        );
    }

    #[test]
    fn test_delete_is_snapshot_gated_and_tolerant() {
        let dir = TempDir::new().unwrap();
        let root = out_root(&dir);
        std::fs::create_dir_all(root.as_std_path()).unwrap();
        std::fs::write(root.join("gone.txt").as_std_path(), "bye").unwrap();

        let mut writer = OutputWriter::new(root.clone(), true);
        writer.delete_file("gone.txt").unwrap();
        assert!(!root.join("gone.txt").exists());
        let snapshot = writer.snapshot_created().unwrap();
        assert!(snapshot.join("gone.txt").exists());

        // Deleting a missing file is a no-op.
        writer.delete_file("never-there.txt").unwrap();
    }

    #[test]
    fn test_quarantine_writes_raw_payload() {
        let dir = TempDir::new().unwrap();
        let writer = OutputWriter::new(out_root(&dir), false);

        let step = StepKey::file_chunk("A3", "ok.py", 0);
        writer.quarantine(&step, "not json at all");

        let quarantined = std::fs::read_to_string(
            out_root(&dir)
                .join("_invalid/A3_ok.py_0.json")
                .as_std_path(),
        )
        .unwrap();
        assert_eq!(quarantined, "not json at all");
    }
}
