//! Provider error taxonomy
//!
//! Every error that leaves the transport carries a sanitized message: no
//! bearer tokens, no API keys, no local path prefixes. Retryability is a
//! property of the variant (plus status for API errors), so callers never
//! re-derive it from message text.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network-level failure: connect/reset/read errors.
    #[error("transport failure: {message}")]
    Transport { message: String },
    /// Request exceeded the per-request timeout.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },
    /// HTTP 429. The transport honors a `Retry-After` header once per
    /// request execution before falling back to normal backoff.
    #[error("rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },
    /// Any other non-2xx response.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    /// The circuit breaker is open; no request was attempted.
    #[error("provider cooling down; circuit breaker open")]
    CoolingDown,
    /// The run's cancellation flag tripped during this request.
    #[error("request cancelled")]
    Cancelled,
    /// Client-side construction problems (bad base URL, missing key).
    #[error("provider misconfiguration: {message}")]
    Misconfigured { message: String },
}

impl ProviderError {
    /// Stable machine-readable kind tag, used in events and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Api { .. } => "api",
            Self::CoolingDown => "cooling_down",
            Self::Cancelled => "cancelled",
            Self::Misconfigured { .. } => "misconfigured",
        }
    }

    /// HTTP status, where one exists.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether the transport may retry this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Api { status, .. } => {
                matches!(status, 408 | 425) || *status >= 500
            }
            Self::CoolingDown | Self::Cancelled | Self::Misconfigured { .. } => false,
        }
    }

    /// Whether this error reports an expired server-side response chain.
    ///
    /// The cascade maps such failures to a contract error with a distinct
    /// reason so the user can restart without chaining.
    #[must_use]
    pub fn is_expired_chain(&self) -> bool {
        match self {
            Self::Api { status, message } if matches!(status, 400 | 404) => {
                let lower = message.to_ascii_lowercase();
                lower.contains("previous_response")
                    && (lower.contains("expired") || lower.contains("not found"))
            }
            _ => false,
        }
    }
}
