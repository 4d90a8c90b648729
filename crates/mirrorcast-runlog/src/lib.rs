//! Run logging
//!
//! Layout under `LOG/<run_id>/`:
//!
//! ```text
//! run_state.json        latest durable RunState snapshot
//! events.jsonl          append-only event stream
//! requests/<step>.json  outbound request artifacts
//! responses/<step>.json raw response artifacts
//! manifests/*.json      mirror manifests
//! ui_state.json         opaque UI snapshot
//! ```
//!
//! Every payload passes the scrubber before it touches disk, and every
//! write is atomic. The logger never raises into the cascade: disk
//! failures flip it into degraded mode, events buffer in memory, and one
//! `degraded_logging` event records the transition.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::warn;

use mirrorcast_redaction::redact_value;
use mirrorcast_utils::atomic_write::{append_line_synced, write_json_atomic};
use mirrorcast_utils::ids::StepKey;
use mirrorcast_utils::types::{RunRequest, RunState};

/// Name of the log root directory, excluded from all tree walks.
pub const LOG_DIR_NAME: &str = "LOG";

#[derive(Debug, Error)]
pub enum RunlogError {
    #[error("run directory not found: {0}")]
    RunNotFound(Utf8PathBuf),
    #[error("failed to read run state {path}: {reason}")]
    Unreadable { path: Utf8PathBuf, reason: String },
}

/// Event severity, matching tracing's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    /// Monotonic per-run sequence number; causal order within the run.
    pub seq: u64,
    pub level: EventLevel,
    pub step: String,
    pub kind: String,
    pub data: Value,
}

/// Writer for one run's log directory.
pub struct RunLogger {
    dir: Utf8PathBuf,
    seq: AtomicU64,
    degraded: AtomicBool,
    buffered: Mutex<Vec<Event>>,
}

impl RunLogger {
    /// Open (creating) the log directory for a run.
    #[must_use]
    pub fn create(log_root: &Utf8Path, run_id: &str) -> Self {
        let dir = log_root.join(LOG_DIR_NAME).join(run_id);
        let logger = Self {
            dir,
            seq: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            buffered: Mutex::new(Vec::new()),
        };
        if let Err(e) = fs::create_dir_all(logger.dir.as_std_path()) {
            logger.enter_degraded(&format!("create log dir: {e}"));
        }
        logger
    }

    /// Reopen an existing run directory for resume, continuing the event
    /// sequence after the highest sequence number already on disk.
    #[must_use]
    pub fn reopen(log_root: &Utf8Path, run_id: &str) -> Self {
        let logger = Self::create(log_root, run_id);
        let next_seq = read_events(&logger.dir)
            .map(|events| events.last().map_or(0, |event| event.seq + 1))
            .unwrap_or(0);
        logger.seq.store(next_seq, Ordering::SeqCst);
        logger
    }

    /// The run's log directory (`LOG/<run_id>`).
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Whether disk logging has failed and events are buffering in memory.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Events held only in memory because of a disk failure.
    #[must_use]
    pub fn buffered_events(&self) -> Vec<Event> {
        self.buffered.lock().expect("runlog mutex poisoned").clone()
    }

    /// Persist the latest state snapshot.
    pub fn write_state(&self, state: &RunState) {
        let Ok(value) = serde_json::to_value(state) else {
            return;
        };
        self.write_artifact_value("run_state.json", &redact_value(&value));
    }

    /// Append one event to the stream. Never fails; degrades instead.
    pub fn append_event(&self, level: EventLevel, step: &str, kind: &str, data: Value) {
        let event = Event {
            ts: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            level,
            step: step.to_string(),
            kind: kind.to_string(),
            data: redact_value(&data),
        };

        if self.is_degraded() {
            self.buffered
                .lock()
                .expect("runlog mutex poisoned")
                .push(event);
            return;
        }

        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = append_line_synced(&self.dir.join("events.jsonl"), &line) {
                    self.enter_degraded(&format!("append event: {e}"));
                    self.buffered
                        .lock()
                        .expect("runlog mutex poisoned")
                        .push(event);
                }
            }
            Err(e) => warn!(error = %e, "event serialization failed; dropping"),
        }
    }

    /// Store an outbound request artifact.
    pub fn write_request(&self, step: &StepKey, payload: &Value) {
        self.write_artifact_value(&format!("requests/{step}.json"), &redact_value(payload));
    }

    /// Store a raw response artifact.
    pub fn write_response(&self, step: &StepKey, payload: &Value) {
        self.write_artifact_value(&format!("responses/{step}.json"), &redact_value(payload));
    }

    /// Store a mirror manifest.
    pub fn write_manifest(&self, name: &str, payload: &Value) {
        self.write_artifact_value(&format!("manifests/{name}.json"), &redact_value(payload));
    }

    /// Store an opaque UI snapshot.
    pub fn write_ui_state(&self, payload: &Value) {
        self.write_artifact_value("ui_state.json", &redact_value(payload));
    }

    /// Persist the originating request so the run can be resumed by id.
    pub fn write_run_request(&self, request: &RunRequest) {
        let Ok(value) = serde_json::to_value(request) else {
            return;
        };
        self.write_artifact_value("run_request.json", &redact_value(&value));
    }

    fn write_artifact_value(&self, rel: &str, value: &Value) {
        if self.is_degraded() {
            return;
        }
        if let Err(e) = write_json_atomic(&self.dir.join(rel), value) {
            self.enter_degraded(&format!("write {rel}: {e}"));
        }
    }

    fn enter_degraded(&self, reason: &str) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "run logging degraded; buffering events in memory");
        // One transition event, buffered since disk just failed.
        let event = Event {
            ts: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            level: EventLevel::Warn,
            step: String::new(),
            kind: "degraded_logging".to_string(),
            data: serde_json::json!({ "reason": reason }),
        };
        self.buffered
            .lock()
            .expect("runlog mutex poisoned")
            .push(event);
    }
}

/// Read a run's latest durable state for resume.
///
/// # Errors
///
/// Fails if the run directory or its state snapshot is missing or
/// unparseable.
pub fn read_state(log_root: &Utf8Path, run_id: &str) -> Result<RunState, RunlogError> {
    let dir = log_root.join(LOG_DIR_NAME).join(run_id);
    if !dir.is_dir() {
        return Err(RunlogError::RunNotFound(dir));
    }
    let path = dir.join("run_state.json");
    let content =
        fs::read_to_string(path.as_std_path()).map_err(|e| RunlogError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    serde_json::from_str(&content).map_err(|e| RunlogError::Unreadable {
        path,
        reason: e.to_string(),
    })
}

/// Read back the originating request of a run, for resume.
///
/// # Errors
///
/// Fails if the run directory or the stored request is missing or
/// unparseable.
pub fn read_run_request(log_root: &Utf8Path, run_id: &str) -> Result<RunRequest, RunlogError> {
    let path = log_root
        .join(LOG_DIR_NAME)
        .join(run_id)
        .join("run_request.json");
    let content =
        fs::read_to_string(path.as_std_path()).map_err(|e| RunlogError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    serde_json::from_str(&content).map_err(|e| RunlogError::Unreadable {
        path,
        reason: e.to_string(),
    })
}

/// Enumerate run states under a log root, newest first. Unreadable run
/// directories are skipped, not fatal.
#[must_use]
pub fn list_states(log_root: &Utf8Path) -> Vec<RunState> {
    let dir = log_root.join(LOG_DIR_NAME);
    let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
        return Vec::new();
    };
    let mut states: Vec<RunState> = entries
        .flatten()
        .filter_map(|entry| {
            let run_id = entry.file_name().to_string_lossy().to_string();
            read_state(log_root, &run_id).ok()
        })
        .collect();
    states.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    states
}

/// Read the full event stream of a run.
///
/// # Errors
///
/// Fails when the event file exists but cannot be read; a missing file is
/// an empty stream.
pub fn read_events(dir: &Utf8Path) -> Result<Vec<Event>, RunlogError> {
    let path = dir.join("events.jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path.as_std_path()).map_err(|e| RunlogError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorcast_utils::types::{RunFlags, RunMode, RunRequest};
    use serde_json::json;
    use tempfile::TempDir;

    fn log_root(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    fn state(run_id: &str) -> RunState {
        let request = RunRequest {
            mode: RunMode::Qa,
            project: None,
            model: "omni-medium".to_string(),
            prompt: "hi".to_string(),
            previous_response_id: None,
            input_root: None,
            output_root: None,
            attached_file_ids: Vec::new(),
            flags: RunFlags::default(),
        };
        RunState::new(run_id.to_string(), &request)
    }

    #[test]
    fn test_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        let logger = RunLogger::create(&root, "RUN_A");

        let mut run_state = state("RUN_A");
        run_state.advance_cursor(2);
        logger.write_state(&run_state);

        let read = read_state(&root, "RUN_A").unwrap();
        assert_eq!(read.run_id, "RUN_A");
        assert_eq!(read.cursor, 2);
    }

    #[test]
    fn test_events_are_sequenced_and_append_only() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        let logger = RunLogger::create(&root, "RUN_A");

        logger.append_event(EventLevel::Info, "A1", "step_started", json!({}));
        logger.append_event(EventLevel::Info, "A1", "step_done", json!({"ok": true}));

        let events = read_events(logger.dir()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
        assert_eq!(events[1].kind, "step_done");
    }

    #[test]
    fn test_payloads_are_scrubbed_before_writing() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        let logger = RunLogger::create(&root, "RUN_A");

        let step = StepKey::new("A1");
        logger.write_request(
            &step,
            &json!({"model": "m", "api_key": "sk-live-very-secret-value"}),
        );

        let raw = fs::read_to_string(
            logger.dir().join("requests/A1.json").as_std_path(),
        )
        .unwrap();
        assert!(!raw.contains("sk-live-very-secret-value"));
        assert!(raw.contains("[REDACTED]"));
    }

    #[test]
    fn test_event_data_is_scrubbed() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        let logger = RunLogger::create(&root, "RUN_A");

        logger.append_event(
            EventLevel::Warn,
            "A1",
            "auth_retry",
            json!({"authorization": "Bearer abc123"}),
        );
        let raw =
            fs::read_to_string(logger.dir().join("events.jsonl").as_std_path()).unwrap();
        assert!(!raw.contains("abc123"));
    }

    #[test]
    fn test_degraded_mode_buffers_instead_of_raising() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        // Occupy the LOG name with a file so directory creation fails.
        fs::write(root.join(LOG_DIR_NAME).as_std_path(), b"not a dir").unwrap();

        let logger = RunLogger::create(&root, "RUN_A");
        assert!(logger.is_degraded());

        // Writes after degradation are silent no-ops; events buffer.
        logger.append_event(EventLevel::Info, "A1", "step_started", json!({}));
        let buffered = logger.buffered_events();
        assert!(
            buffered
                .iter()
                .any(|event| event.kind == "degraded_logging")
        );
        assert!(buffered.iter().any(|event| event.kind == "step_started"));
    }

    #[test]
    fn test_manifest_and_ui_state_artifacts_land_in_layout() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        let logger = RunLogger::create(&root, "RUN_A");

        logger.write_manifest("RUN_A", &json!({"entries": []}));
        logger.write_ui_state(&json!({"selected_tab": "progress"}));

        assert!(logger.dir().join("manifests/RUN_A.json").is_file());
        assert!(logger.dir().join("ui_state.json").is_file());
    }

    #[test]
    fn test_run_request_round_trips_for_resume() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        let logger = RunLogger::create(&root, "RUN_A");

        let request = RunRequest {
            mode: RunMode::Qa,
            project: Some("demo".to_string()),
            model: "omni-medium".to_string(),
            prompt: "why".to_string(),
            previous_response_id: None,
            input_root: None,
            output_root: None,
            attached_file_ids: vec!["file_9".to_string()],
            flags: RunFlags::default(),
        };
        logger.write_run_request(&request);

        let read = read_run_request(&root, "RUN_A").unwrap();
        assert_eq!(read.model, request.model);
        assert_eq!(read.attached_file_ids, request.attached_file_ids);
        assert_eq!(read.project.as_deref(), Some("demo"));
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);
        {
            let logger = RunLogger::create(&root, "RUN_A");
            logger.append_event(EventLevel::Info, "A1", "one", json!({}));
            logger.append_event(EventLevel::Info, "A1", "two", json!({}));
        }
        let logger = RunLogger::reopen(&root, "RUN_A");
        logger.append_event(EventLevel::Info, "A2", "three", json!({}));

        let events = read_events(logger.dir()).unwrap();
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_list_states_orders_newest_first() {
        let dir = TempDir::new().unwrap();
        let root = log_root(&dir);

        let older = RunLogger::create(&root, "RUN_OLD");
        let mut older_state = state("RUN_OLD");
        older_state.created_at = Utc::now() - chrono::Duration::hours(1);
        older.write_state(&older_state);

        let newer = RunLogger::create(&root, "RUN_NEW");
        newer.write_state(&state("RUN_NEW"));

        let states = list_states(&root);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].run_id, "RUN_NEW");
        assert_eq!(states[1].run_id, "RUN_OLD");
    }
}
