//! Run event stream
//!
//! One broadcast channel per run. Events are causally ordered: a per-run
//! monotonic sequence number plus the step label. The same events are
//! mirrored into the run log so the stream can be reconstructed offline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;

/// What any UI sees while a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub step: String,
    /// Coarse progress in `[0, 100]`.
    pub percent: u8,
    #[serde(default)]
    pub eta_secs: Option<u64>,
    pub kind: String,
    pub message: String,
}

/// Broadcast fan-out for one run's events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
    seq: Arc<AtomicU64>,
    last_emit: Arc<Mutex<Instant>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            seq: Arc::new(AtomicU64::new(0)),
            last_emit: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Subscribe to the live stream. Slow consumers may observe gaps.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Emit one event, returning it (already sequenced) so the caller can
    /// mirror it into the run log.
    pub fn emit(&self, step: &str, percent: u8, kind: &str, message: impl Into<String>) -> RunEvent {
        let event = RunEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            step: step.to_string(),
            percent: percent.min(100),
            eta_secs: None,
            kind: kind.to_string(),
            message: message.into(),
        };
        *self.last_emit.lock().expect("event bus mutex poisoned") = Instant::now();
        // Nobody listening is fine; the run log still has everything.
        let _ = self.sender.send(event.clone());
        event
    }

    /// Time since the last emission, for the stall heartbeat.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_emit
            .lock()
            .expect("event bus mutex poisoned")
            .elapsed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
