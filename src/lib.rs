//! mirrorcast — desktop orchestrator for staged Responses-API cascades
//!
//! This crate is the thin integration layer: it re-exports the workspace
//! crates as a coherent API and hosts the CLI. The interesting machinery
//! lives in the member crates:
//!
//! - [`pathsafe`]: path safety rules and the mirror walker
//! - [`redaction`]: secret scrubbing for logs and uploads
//! - [`runlog`]: atomic per-run log directories
//! - [`ledger`]: the embedded receipt store
//! - [`provider`]: transport (retry/backoff/breaker) and the typed client
//! - [`capability`]: per-model feature probing with a TTL cache
//! - [`contract`]: strict JSON response contracts and chunk assembly
//! - [`snapshot`]: lazy versioning snapshots
//! - [`mirror`]: input-tree mirroring into the Provider
//! - [`engine`]: the cascade, batch monitor, supervisor, and Run API

pub use mirrorcast_capability as capability;
pub use mirrorcast_config as config;
pub use mirrorcast_contract as contract;
pub use mirrorcast_engine as engine;
pub use mirrorcast_ledger as ledger;
pub use mirrorcast_mirror as mirror;
pub use mirrorcast_pathsafe as pathsafe;
pub use mirrorcast_provider as provider;
pub use mirrorcast_redaction as redaction;
pub use mirrorcast_runlog as runlog;
pub use mirrorcast_snapshot as snapshot;
pub use mirrorcast_utils as utils;

pub mod cli;
