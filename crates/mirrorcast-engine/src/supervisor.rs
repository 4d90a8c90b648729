//! Run supervisor
//!
//! Owns one run at a time per process. Validates requests before any run
//! state exists, spawns the cascade, publishes the event stream, flips the
//! cancellation flag cooperatively, enforces the hard-kill grace, and
//! decides resume. Every terminal state is written by the run task itself;
//! the hard-kill fallback writes an explicit non-cooperative marker.

use camino::Utf8PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mirrorcast_capability::CapabilityCache;
use mirrorcast_config::{Config, PricingTable};
use mirrorcast_ledger::Ledger;
use mirrorcast_provider::ProviderClient;
use mirrorcast_runlog::{EventLevel, RunLogger, list_states, read_run_request, read_state};
use mirrorcast_utils::cancel::CancelFlag;
use mirrorcast_utils::ids::new_run_id;
use mirrorcast_utils::types::{RunRequest, RunState, RunStatus, RunSummary};

use crate::cascade::{self, CascadeContext};
use crate::error::RunError;
use crate::event::{EventBus, RunEvent};
use crate::writer::OutputWriter;

/// Idle threshold after which the stall heartbeat warns.
const STALL_THRESHOLD: Duration = Duration::from_secs(300);

/// How often the heartbeat looks at the event clock.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// One-way gate the dry-run halt waits behind.
#[derive(Debug, Clone, Default)]
pub struct ContinueGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    open: AtomicBool,
    notify: Notify,
}

impl ContinueGate {
    /// Open the gate; idempotent.
    pub fn open(&self) {
        self.inner.open.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once the gate is open.
    pub async fn opened(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a run in flight.
pub struct RunHandle {
    run_id: String,
    events: EventBus,
    cancel: CancelFlag,
    continue_gate: ContinueGate,
    join: Mutex<Option<JoinHandle<RunStatus>>>,
    result: OnceLock<RunStatus>,
}

impl RunHandle {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Subscribe to the live event stream.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Signal cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Release a dry-run halt so the cascade proceeds to B3.
    pub fn allow_continue(&self) {
        self.continue_gate.open();
    }

    /// Wait for the run task to finish and return its terminal status.
    pub async fn wait(&self) -> RunStatus {
        let join = self.join.lock().expect("run handle mutex poisoned").take();
        match join {
            Some(handle) => {
                let status = handle.await.unwrap_or(RunStatus::Failed);
                let _ = self.result.set(status);
                status
            }
            None => *self.result.get().unwrap_or(&RunStatus::Failed),
        }
    }

    fn abort(&self) {
        if let Some(handle) = self.join.lock().expect("run handle mutex poisoned").take() {
            handle.abort();
        }
    }
}

/// Construction options for a supervisor.
pub struct SupervisorOptions {
    pub config: Config,
    /// Directory under which `LOG/<run_id>/` lives.
    pub log_root: Utf8PathBuf,
    /// Ignore the capability cache TTL and re-probe every run.
    pub force_probe: bool,
}

/// The per-process run owner.
pub struct Supervisor {
    client: Arc<dyn ProviderClient>,
    ledger: Arc<Ledger>,
    capability_cache: Arc<CapabilityCache>,
    pricing: Option<PricingTable>,
    options: SupervisorOptions,
    busy: Arc<AtomicBool>,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        client: Arc<dyn ProviderClient>,
        ledger: Arc<Ledger>,
        capability_cache: Arc<CapabilityCache>,
        pricing: Option<PricingTable>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            client,
            ledger,
            capability_cache,
            pricing,
            options,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a new run.
    ///
    /// # Errors
    ///
    /// Rejects invalid requests before any state exists and refuses to run
    /// two runs concurrently.
    pub fn start(&self, request: RunRequest) -> Result<RunHandle, RunError> {
        request.validate()?;
        self.acquire()?;

        let run_id = new_run_id();
        let logger = Arc::new(RunLogger::create(&self.options.log_root, &run_id));
        logger.write_run_request(&request);
        let state = RunState::new(run_id.clone(), &request);
        logger.write_state(&state);

        Ok(self.launch(request, state, logger))
    }

    /// Resume a non-terminal run by id.
    ///
    /// # Errors
    ///
    /// Fails when the run directory is missing, the run already reached a
    /// terminal state, or another run is active.
    pub fn resume(&self, run_id: &str) -> Result<RunHandle, RunError> {
        let state = read_state(&self.options.log_root, run_id)
            .map_err(|_| RunError::RunNotFound(run_id.to_string()))?;
        if state.status.is_terminal() {
            return Err(RunError::AlreadyTerminal(run_id.to_string()));
        }
        let request = read_run_request(&self.options.log_root, run_id)
            .map_err(|e| RunError::Storage(e.to_string()))?;
        self.acquire()?;

        let logger = Arc::new(RunLogger::reopen(&self.options.log_root, run_id));
        info!(run_id, cursor = state.cursor, "resuming run");
        Ok(self.launch(request, state, logger))
    }

    /// Known runs under the log root, newest first.
    #[must_use]
    pub fn list_runs(&self) -> Vec<RunSummary> {
        list_states(&self.options.log_root)
            .iter()
            .map(RunSummary::from)
            .collect()
    }

    /// Wait for a run to end; after `grace`, hard-kill it and write the
    /// non-cooperative marker.
    pub async fn finish(&self, handle: &RunHandle, grace: Duration) -> RunStatus {
        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(run_id = handle.run_id(), "grace expired; aborting run task");
                handle.abort();
                self.busy.store(false, Ordering::SeqCst);

                if let Ok(mut state) = read_state(&self.options.log_root, handle.run_id()) {
                    state.set_status(RunStatus::Cancelled);
                    let logger =
                        RunLogger::reopen(&self.options.log_root, handle.run_id());
                    logger.write_state(&state);
                    logger.append_event(
                        EventLevel::Warn,
                        "",
                        "non_cooperative_termination",
                        serde_json::json!({"grace_secs": grace.as_secs()}),
                    );
                }
                RunStatus::Cancelled
            }
        }
    }

    fn acquire(&self) -> Result<(), RunError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::Busy);
        }
        Ok(())
    }

    fn launch(
        &self,
        request: RunRequest,
        state: RunState,
        logger: Arc<RunLogger>,
    ) -> RunHandle {
        let events = EventBus::new();
        let cancel = CancelFlag::new();
        let continue_gate = ContinueGate::default();
        let run_id = state.run_id.clone();

        let task = RunTask {
            request,
            state,
            logger,
            events: events.clone(),
            cancel: cancel.clone(),
            continue_gate: continue_gate.clone(),
            client: Arc::clone(&self.client),
            ledger: Arc::clone(&self.ledger),
            capability_cache: Arc::clone(&self.capability_cache),
            pricing: self.pricing.clone(),
            config: self.options.config.clone(),
            force_probe: self.options.force_probe,
            busy: Arc::clone(&self.busy),
        };
        let join = tokio::spawn(task.run());

        RunHandle {
            run_id,
            events,
            cancel,
            continue_gate,
            join: Mutex::new(Some(join)),
            result: OnceLock::new(),
        }
    }
}

struct RunTask {
    request: RunRequest,
    state: RunState,
    logger: Arc<RunLogger>,
    events: EventBus,
    cancel: CancelFlag,
    continue_gate: ContinueGate,
    client: Arc<dyn ProviderClient>,
    ledger: Arc<Ledger>,
    capability_cache: Arc<CapabilityCache>,
    pricing: Option<PricingTable>,
    config: Config,
    force_probe: bool,
    busy: Arc<AtomicBool>,
}

impl RunTask {
    async fn run(mut self) -> RunStatus {
        let run_id = self.state.run_id.clone();
        self.state.set_status(RunStatus::Running);
        self.logger.write_state(&self.state);
        let event = self.events.emit("", 0, "run_started", run_id.clone());
        self.logger.append_event(
            EventLevel::Info,
            "",
            &event.kind,
            serde_json::json!({"run_id": run_id}),
        );

        let heartbeat = self.spawn_heartbeat();
        let result = self.drive().await;
        heartbeat.abort();

        let status = match &result {
            Ok(()) => RunStatus::Done,
            Err(error) if error.is_cancellation() => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        };
        self.state.set_status(status);
        self.logger.write_state(&self.state);

        let (kind, message) = match &result {
            Ok(()) => ("run_done".to_string(), "run completed".to_string()),
            Err(error) if error.is_cancellation() => {
                ("run_cancelled".to_string(), "run cancelled".to_string())
            }
            Err(error) => ("run_failed".to_string(), format!("{}: {error}", error.kind())),
        };
        let event = self.events.emit("", 100, &kind, message.clone());
        self.logger.append_event(
            match status {
                RunStatus::Done => EventLevel::Info,
                _ => EventLevel::Warn,
            },
            "",
            &event.kind,
            serde_json::json!({"message": message}),
        );

        self.busy.store(false, Ordering::SeqCst);
        status
    }

    async fn drive(&mut self) -> Result<(), RunError> {
        let caps = mirrorcast_capability::resolve(
            &self.capability_cache,
            self.client.as_ref(),
            &self.request.model,
            self.force_probe,
        )
        .await?;

        let writer = self
            .request
            .output_root
            .clone()
            .map(|root| OutputWriter::new(root, self.request.flags.versioning));

        let mut ctx = CascadeContext {
            request: self.request.clone(),
            caps,
            client: Arc::clone(&self.client),
            logger: Arc::clone(&self.logger),
            ledger: Arc::clone(&self.ledger),
            pricing: self.pricing.clone(),
            pricing_ttl_days: self.config.pricing_ttl_days,
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            continue_gate: self.continue_gate.clone(),
            walker_policy: self.config.walker.clone(),
            upload_concurrency: self.config.upload_concurrency,
            state: std::mem::replace(
                &mut self.state,
                RunState::new(String::new(), &self.request),
            ),
            writer,
        };

        let result = cascade::execute(&mut ctx).await;
        if let Some(writer) = &ctx.writer {
            ctx.state.snapshot_created = writer.snapshot_created().is_some();
        }
        self.state = ctx.state;
        result
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let logger = Arc::clone(&self.logger);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    () = cancel.cancelled() => break,
                }
                if events.idle_for() > STALL_THRESHOLD {
                    warn!("no run events for over five minutes; run may be stalled");
                    logger.append_event(
                        EventLevel::Warn,
                        "",
                        "stall_warning",
                        serde_json::json!({
                            "idle_secs": events.idle_for().as_secs()
                        }),
                    );
                }
            }
        })
    }
}
