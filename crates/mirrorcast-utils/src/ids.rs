//! Run and step identifiers
//!
//! Run ids have the shape `RUN_<DDMMYYYYHHMM>_<rand4>`: a minute-resolution
//! timestamp plus a short random suffix so two runs started in the same
//! minute stay distinct. The same 12-digit timestamp format names versioning
//! snapshots and vector stores.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Format a timestamp as the 12-digit `DDMMYYYYHHMM` form used in run ids,
/// snapshot directory names, and vector store names.
#[must_use]
pub fn timestamp_digits(at: DateTime<Local>) -> String {
    at.format("%d%m%Y%H%M").to_string()
}

/// Generate a fresh run id for a run starting now.
#[must_use]
pub fn new_run_id() -> String {
    run_id_at(Local::now())
}

/// Generate a run id for the given start time.
#[must_use]
pub fn run_id_at(at: DateTime<Local>) -> String {
    let rand4: String = Uuid::new_v4().simple().to_string()[..4].to_string();
    format!("RUN_{}_{}", timestamp_digits(at), rand4)
}

/// Logical identity of one cascade step within a run.
///
/// Step keys name request/response artifacts on disk, seed idempotency
/// tokens, and form half of the receipt dedup key. They are plain strings
/// with a constrained character set: alphanumerics, `_`, `-`, and `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepKey(String);

impl StepKey {
    /// Build a step key from an already-safe label such as `A1` or `QA`.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self(sanitize(&label.into()))
    }

    /// Key for one prompt-ingest chunk (`A0_<n>`).
    #[must_use]
    pub fn ingest(index: usize) -> Self {
        Self(format!("A0_{index}"))
    }

    /// Key for one file chunk of a content-producing step, e.g.
    /// `A3_src_main.py_0`. The path is flattened to stay filename-safe.
    #[must_use]
    pub fn file_chunk(stage: &str, rel_path: &str, chunk_index: u32) -> Self {
        Self(format!(
            "{}_{}_{}",
            sanitize(stage),
            sanitize(rel_path),
            chunk_index
        ))
    }

    /// The raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Replace everything outside `[A-Za-z0-9_.-]` with `_` so step keys can be
/// used directly as file names under `LOG/<run_id>/requests/`.
fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_digits_is_twelve_digits() {
        let at = Local.with_ymd_and_hms(2025, 3, 7, 9, 5, 0).unwrap();
        let digits = timestamp_digits(at);
        assert_eq!(digits, "070320250905");
        assert_eq!(digits.len(), 12);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_run_id_shape() {
        let at = Local.with_ymd_and_hms(2025, 12, 31, 23, 59, 0).unwrap();
        let id = run_id_at(at);
        assert!(id.starts_with("RUN_311220252359_"));
        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 4);
    }

    #[test]
    fn test_run_ids_are_distinct_within_a_minute() {
        let at = Local.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = run_id_at(at);
        let b = run_id_at(at);
        assert_ne!(a, b);
    }

    #[test]
    fn test_step_key_flattens_paths() {
        let key = StepKey::file_chunk("A3", "src/main.py", 0);
        assert_eq!(key.as_str(), "A3_src_main.py_0");
        assert!(!key.as_str().contains('/'));
    }

    #[test]
    fn test_step_key_sanitizes_hostile_labels() {
        let key = StepKey::new("../../etc/passwd");
        assert!(!key.as_str().contains('/'));
    }
}
