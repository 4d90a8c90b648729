//! The run engine
//!
//! Everything between a validated `RunRequest` and a terminal run state
//! lives here: the cascade state machine for the four modes, the batch
//! monitor, the supervisor that owns lifecycle/cancellation/resume, and
//! the headless Run API any UI consumes.

mod batch;
mod cascade;
mod error;
mod event;
mod supervisor;
mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod double;

pub use batch::{cancel_batch, fetch_batch_result, list_open_batches};
pub use error::RunError;
pub use event::{EventBus, RunEvent};
pub use supervisor::{ContinueGate, RunHandle, Supervisor, SupervisorOptions};
