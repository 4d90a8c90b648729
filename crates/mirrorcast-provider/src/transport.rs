//! HTTP transport with retry, backoff, and circuit breaking
//!
//! Retry policy: retry on transport errors, timeouts, and HTTP
//! 408/425/429/5xx; never on other 4xx. Backoff is
//! `min(cap, base * 2^attempt) * (1 + jitter)` with jitter in `[0, 1)`. A
//! `Retry-After` header longer than the computed backoff is honored
//! exactly once per request execution. The breaker trips after N
//! consecutive retryable failures inside a window, stays open for a fixed
//! interval, then half-opens with a single probe.

use mirrorcast_config::TransportConfig;
use mirrorcast_redaction::redact_error_message;
use mirrorcast_utils::cancel::CancelFlag;
use rand::Rng;
use reqwest::StatusCode;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Longest error-body excerpt carried into an error message.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    /// Backoff before retrying after `attempt` (0-based) failures.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2_u32.saturating_pow(attempt));
        let capped = exp.min(self.cap);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        capped.mul_f64(1.0 + jitter)
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerPolicy {
    failures: u32,
    window: Duration,
    open_for: Duration,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

enum BreakerDecision {
    Closed,
    Open,
    HalfOpenProbe,
}

/// Shared HTTP transport for one provider endpoint.
pub struct Transport {
    client: reqwest::Client,
    request_timeout: Duration,
    retry: RetryPolicy,
    breaker_policy: BreakerPolicy,
    breaker: Mutex<BreakerState>,
    cancel: CancelFlag,
}

impl Transport {
    /// Build a transport from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Misconfigured`] if the HTTP client cannot
    /// be constructed.
    pub fn new(config: &TransportConfig, cancel: CancelFlag) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProviderError::Misconfigured {
                message: redact_error_message(&format!("failed to build HTTP client: {e}")),
            })?;

        Ok(Self {
            client,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base: Duration::from_millis(config.backoff_base_ms),
                cap: Duration::from_millis(config.backoff_cap_ms),
            },
            breaker_policy: BreakerPolicy {
                failures: config.breaker_failures,
                window: Duration::from_secs(config.breaker_window_secs),
                open_for: Duration::from_secs(config.breaker_open_secs),
            },
            breaker: Mutex::new(BreakerState::default()),
            cancel,
        })
    }

    /// The underlying reqwest client, for request construction.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a request with the full reliability policy applied.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::CoolingDown`] without attempting anything
    /// while the breaker is open, [`ProviderError::Cancelled`] when the
    /// cancellation flag trips, and the mapped terminal error otherwise.
    pub async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let is_probe = match self.breaker_decision() {
            BreakerDecision::Closed => false,
            BreakerDecision::HalfOpenProbe => true,
            BreakerDecision::Open => return Err(ProviderError::CoolingDown),
        };

        let result = self.execute_inner(request, operation, is_probe).await;
        if is_probe {
            self.finish_probe(result.is_ok());
        }
        result
    }

    async fn execute_inner(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
        is_probe: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempt: u32 = 0;
        let mut retry_after_honored = false;
        // Streaming bodies (multipart uploads) cannot be cloned; they get
        // exactly one attempt and their failure surfaces un-retried.
        let mut original = Some(request);

        loop {
            if self.cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let replayable = original.as_ref().is_some_and(|r| r.try_clone().is_some());
            let prepared = if replayable {
                original
                    .as_ref()
                    .and_then(reqwest::RequestBuilder::try_clone)
                    .ok_or_else(|| ProviderError::Transport {
                        message: "request body is not replayable".to_string(),
                    })?
            } else {
                original.take().ok_or_else(|| ProviderError::Transport {
                    message: "request body is not replayable".to_string(),
                })?
            };
            let prepared = prepared.timeout(self.request_timeout);

            debug!(operation, attempt, "sending provider request");

            let outcome = tokio::select! {
                response = prepared.send() => response,
                () = self.cancel.cancelled() => return Err(ProviderError::Cancelled),
            };

            let error = match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.record_success();
                        return Ok(response);
                    }
                    let retry_after = parse_retry_after(&response);
                    let error = self.map_status(status, response).await;
                    if !error.is_retryable() {
                        // A definitive response closes any failure streak.
                        self.record_success();
                        return Err(error);
                    }
                    self.record_retryable_failure();
                    if is_probe || original.is_none() {
                        // The single half-open probe never retries, and
                        // neither does a consumed one-shot body.
                        return Err(error);
                    }
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(error);
                    }
                    let mut wait = self.retry.backoff(attempt - 1);
                    if status == StatusCode::TOO_MANY_REQUESTS
                        && let Some(after) = retry_after
                        && after > wait
                        && !retry_after_honored
                    {
                        retry_after_honored = true;
                        wait = after;
                    }
                    warn!(
                        operation,
                        attempt,
                        status = status.as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "retryable provider status"
                    );
                    self.sleep_cancellable(wait).await?;
                    continue;
                }
                Err(send_error) => {
                    let error = if send_error.is_timeout() {
                        ProviderError::Timeout {
                            seconds: self.request_timeout.as_secs(),
                        }
                    } else {
                        ProviderError::Transport {
                            message: redact_error_message(&send_error.to_string()),
                        }
                    };
                    self.record_retryable_failure();
                    if is_probe || original.is_none() {
                        return Err(error);
                    }
                    error
                }
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                return Err(error);
            }
            let wait = self.retry.backoff(attempt - 1);
            warn!(
                operation,
                attempt,
                error = %error,
                wait_ms = wait.as_millis() as u64,
                "retryable transport failure"
            );
            self.sleep_cancellable(wait).await?;
        }
    }

    async fn sleep_cancellable(&self, wait: Duration) -> Result<(), ProviderError> {
        tokio::select! {
            () = tokio::time::sleep(wait) => Ok(()),
            () = self.cancel.cancelled() => Err(ProviderError::Cancelled),
        }
    }

    async fn map_status(&self, status: StatusCode, response: reqwest::Response) -> ProviderError {
        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        let message = redact_error_message(&excerpt);

        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited {
                retry_after_secs: retry_after.map(|d| d.as_secs()),
            }
        } else {
            ProviderError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    fn breaker_decision(&self) -> BreakerDecision {
        let mut state = self.breaker.lock().expect("breaker mutex poisoned");
        match state.opened_at {
            None => BreakerDecision::Closed,
            Some(opened_at) => {
                if opened_at.elapsed() < self.breaker_policy.open_for {
                    BreakerDecision::Open
                } else if state.probe_in_flight {
                    BreakerDecision::Open
                } else {
                    state.probe_in_flight = true;
                    BreakerDecision::HalfOpenProbe
                }
            }
        }
    }

    fn finish_probe(&self, succeeded: bool) {
        let mut state = self.breaker.lock().expect("breaker mutex poisoned");
        state.probe_in_flight = false;
        if succeeded {
            *state = BreakerState::default();
            debug!("circuit breaker closed after successful probe");
        } else {
            state.opened_at = Some(Instant::now());
            warn!("circuit breaker reopened after failed probe");
        }
    }

    fn record_success(&self) {
        let mut state = self.breaker.lock().expect("breaker mutex poisoned");
        state.consecutive = 0;
        state.window_start = None;
    }

    fn record_retryable_failure(&self) {
        let mut state = self.breaker.lock().expect("breaker mutex poisoned");
        let now = Instant::now();
        let in_window = state
            .window_start
            .is_some_and(|start| now.duration_since(start) <= self.breaker_policy.window);
        if in_window {
            state.consecutive += 1;
        } else {
            state.window_start = Some(now);
            state.consecutive = 1;
        }
        if state.consecutive >= self.breaker_policy.failures && state.opened_at.is_none() {
            state.opened_at = Some(now);
            warn!(
                consecutive = state.consecutive,
                "circuit breaker tripped; failing fast"
            );
        }
    }

    /// Whether the breaker is currently refusing traffic.
    #[must_use]
    pub fn is_cooling_down(&self) -> bool {
        matches!(self.breaker_decision_peek(), BreakerDecision::Open)
    }

    fn breaker_decision_peek(&self) -> BreakerDecision {
        let state = self.breaker.lock().expect("breaker mutex poisoned");
        match state.opened_at {
            None => BreakerDecision::Closed,
            Some(opened_at) if opened_at.elapsed() < self.breaker_policy.open_for => {
                BreakerDecision::Open
            }
            Some(_) => BreakerDecision::Closed,
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
