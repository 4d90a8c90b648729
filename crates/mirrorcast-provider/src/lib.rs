//! Provider transport and client
//!
//! Two layers. The transport owns everything about HTTP reliability:
//! per-request timeouts, the retry/backoff policy with `Retry-After`
//! honoring, the circuit breaker, cancellation-aware waits, and error
//! sanitization. The client is the narrow, typed capability the rest of
//! the system consumes; an HTTP implementation rides the transport, and
//! test doubles implement the same trait.

mod client;
mod error;
mod transport;
mod wire;

pub use client::{HttpProviderClient, ProviderClient};
pub use error::ProviderError;
pub use transport::Transport;
pub use wire::{
    BatchStatus, InputSegment, ModelInfo, ProviderFile, ResponseEnvelope, ResponsesRequest, Tool,
    Usage, VectorStoreInfo,
};
