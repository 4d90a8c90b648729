//! Core run data model
//!
//! `RunRequest` is what callers hand the supervisor; `RunState` is the
//! durable, resumable record of a run in flight. State is only ever mutated
//! by the owning supervisor; everything else reads snapshots.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The four operating modes of the orchestrator.
///
/// # Serialization
///
/// Serializes to the uppercase wire form (`"GENERATE"`, `"MODIFY"`,
/// `"QA"`, `"BATCH"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunMode {
    /// Produce a project from scratch via the A1→A2→A3 cascade.
    #[serde(rename = "GENERATE")]
    Generate,
    /// Modify an existing source tree via INGEST→B1→B2→B3.
    #[serde(rename = "MODIFY")]
    Modify,
    /// Text-only question/answer; no filesystem output.
    #[serde(rename = "QA")]
    Qa,
    /// Asynchronous batch producing all files in one response.
    #[serde(rename = "BATCH")]
    Batch,
}

impl RunMode {
    /// The uppercase wire/display form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "GENERATE",
            Self::Modify => "MODIFY",
            Self::Qa => "QA",
            Self::Batch => "BATCH",
        }
    }

    /// Whether this mode writes files under an output root.
    #[must_use]
    pub const fn writes_output(self) -> bool {
        !matches!(self, Self::Qa)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal and non-terminal run statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Per-run behavior toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    /// Snapshot the output tree before the first destructive write.
    #[serde(default)]
    pub versioning: bool,
    /// MODIFY only: halt after B2 and wait for an explicit continue.
    #[serde(default)]
    pub dry_run: bool,
    /// Attach collected diagnostics blobs to the request.
    #[serde(default)]
    pub diagnostics_in: bool,
    /// Persist diagnostics blobs produced during the run.
    #[serde(default)]
    pub diagnostics_out: bool,
}

/// Everything the supervisor needs to start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub mode: RunMode,
    /// Optional project name; feeds vector store and snapshot naming.
    #[serde(default)]
    pub project: Option<String>,
    pub model: String,
    pub prompt: String,
    /// Continue a server-side chain from a previous response.
    #[serde(default)]
    pub previous_response_id: Option<String>,
    /// Local tree mirrored into the Provider (MODIFY only).
    #[serde(default)]
    pub input_root: Option<Utf8PathBuf>,
    /// Where reconstructed files land (all modes but QA).
    #[serde(default)]
    pub output_root: Option<Utf8PathBuf>,
    /// Provider file ids attached verbatim to every request.
    #[serde(default)]
    pub attached_file_ids: Vec<String>,
    #[serde(default)]
    pub flags: RunFlags,
}

/// A `RunRequest` that cannot start. Raised before any run state exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRunRequest {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("model must not be empty")]
    EmptyModel,
    #[error("{mode} does not take an input root")]
    InputRootNotAllowed { mode: RunMode },
    #[error("MODIFY requires an input root")]
    InputRootRequired,
    #[error("{mode} requires an output root")]
    OutputRootRequired { mode: RunMode },
    #[error("QA does not take an output root")]
    OutputRootNotAllowed,
    #[error("dry-run is only meaningful for MODIFY")]
    DryRunNotAllowed,
}

impl RunRequest {
    /// Check mode/root coherence. Called by the supervisor before a run id
    /// is even allocated, so a bad request leaves no trace on disk.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), InvalidRunRequest> {
        if self.prompt.trim().is_empty() {
            return Err(InvalidRunRequest::EmptyPrompt);
        }
        if self.model.trim().is_empty() {
            return Err(InvalidRunRequest::EmptyModel);
        }
        match self.mode {
            RunMode::Generate | RunMode::Batch => {
                if self.input_root.is_some() {
                    return Err(InvalidRunRequest::InputRootNotAllowed { mode: self.mode });
                }
                if self.output_root.is_none() {
                    return Err(InvalidRunRequest::OutputRootRequired { mode: self.mode });
                }
            }
            RunMode::Modify => {
                if self.input_root.is_none() {
                    return Err(InvalidRunRequest::InputRootRequired);
                }
                if self.output_root.is_none() {
                    return Err(InvalidRunRequest::OutputRootRequired { mode: self.mode });
                }
            }
            RunMode::Qa => {
                if self.input_root.is_some() {
                    return Err(InvalidRunRequest::InputRootNotAllowed { mode: self.mode });
                }
                if self.output_root.is_some() {
                    return Err(InvalidRunRequest::OutputRootNotAllowed);
                }
            }
        }
        if self.flags.dry_run && self.mode != RunMode::Modify {
            return Err(InvalidRunRequest::DryRunNotAllowed);
        }
        Ok(())
    }
}

/// One uploaded file in the run's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_id: String,
    pub sha256: String,
    pub size: u64,
}

/// Durable record of a run in flight.
///
/// The step cursor only ever advances; resume reads the last persisted
/// snapshot and recomputes from the first unfinished step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub mode: RunMode,
    pub model: String,
    #[serde(default)]
    pub project: Option<String>,
    pub status: RunStatus,
    /// Monotonically advancing index into the run's step list.
    pub cursor: u32,
    /// Response ids in chain order.
    #[serde(default)]
    pub response_chain: Vec<String>,
    /// Relative path → provider registration for every uploaded file.
    #[serde(default)]
    pub uploaded: BTreeMap<String, UploadedFile>,
    /// Provider id of the uploaded manifest, when that upload worked.
    #[serde(default)]
    pub manifest_file_id: Option<String>,
    /// Output paths planned by the structure step, lexically ordered.
    #[serde(default)]
    pub planned_paths: Vec<String>,
    /// Paths the structure step marked for deletion (MODIFY only).
    #[serde(default)]
    pub planned_deletes: Vec<String>,
    #[serde(default)]
    pub vector_store_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub snapshot_created: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    /// Fresh pending state for a validated request.
    #[must_use]
    pub fn new(run_id: String, request: &RunRequest) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode: request.mode,
            model: request.model.clone(),
            project: request.project.clone(),
            status: RunStatus::Pending,
            cursor: 0,
            response_chain: Vec::new(),
            uploaded: BTreeMap::new(),
            manifest_file_id: None,
            planned_paths: Vec::new(),
            planned_deletes: Vec::new(),
            vector_store_id: None,
            batch_id: None,
            snapshot_created: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the cursor. A lower value is ignored; the cursor never
    /// regresses, even across resume.
    pub fn advance_cursor(&mut self, to: u32) {
        if to > self.cursor {
            self.cursor = to;
        }
        self.touch();
    }

    /// Record a response id at the end of the chain.
    pub fn push_response(&mut self, response_id: impl Into<String>) {
        self.response_chain.push(response_id.into());
        self.touch();
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Compact listing entry for `list_runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: RunMode,
    pub model: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&RunState> for RunSummary {
    fn from(state: &RunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            mode: state.mode,
            model: state.model.clone(),
            status: state.status,
            created_at: state.created_at,
        }
    }
}
