//! Run-level error taxonomy
//!
//! Wraps the per-subsystem errors into the shape the supervisor reports:
//! kind, step, run id, and a sanitized detail string. Retryable transport
//! conditions never reach this level; the transport has already consumed
//! them.

use thiserror::Error;

use mirrorcast_capability::CapabilityError;
use mirrorcast_contract::{AssemblyError, ContractError};
use mirrorcast_ledger::LedgerError;
use mirrorcast_mirror::MirrorError;
use mirrorcast_pathsafe::PathPolicyError;
use mirrorcast_provider::ProviderError;
use mirrorcast_utils::types::InvalidRunRequest;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    PathPolicy(#[from] PathPolicyError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("invalid run request: {0}")]
    Configuration(#[from] InvalidRunRequest),
    #[error("local storage failure: {0}")]
    Storage(String),
    #[error("batch finished in state '{status}'")]
    BatchFailed { status: String },
    #[error("run cancelled")]
    Cancelled,
    #[error("another run is already active in this process")]
    Busy,
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("run {0} already reached a terminal state")]
    AlreadyTerminal(String),
}

impl RunError {
    /// Stable kind tag used in events and terminal state records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(error) => error.kind(),
            Self::Contract(_) => "contract",
            Self::Assembly(_) => "assembly",
            Self::PathPolicy(_) => "path_policy",
            Self::Mirror(MirrorError::Cancelled) | Self::Cancelled => "cancelled",
            Self::Mirror(_) => "mirror",
            Self::Ledger(_) => "ledger",
            Self::Capability(_) => "capability",
            Self::Configuration(_) => "configuration",
            Self::Storage(_) => "storage",
            Self::BatchFailed { .. } => "batch_failed",
            Self::Busy => "busy",
            Self::RunNotFound(_) => "run_not_found",
            Self::AlreadyTerminal(_) => "already_terminal",
        }
    }

    /// Whether this error represents cooperative cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Mirror(MirrorError::Cancelled)
                | Self::Provider(ProviderError::Cancelled)
        )
    }

    /// Failures scoped to one output path: the path dies, the run
    /// continues.
    #[must_use]
    pub fn is_path_scoped(&self) -> bool {
        matches!(
            self,
            Self::Contract(_) | Self::Assembly(_) | Self::PathPolicy(_)
        )
    }
}
