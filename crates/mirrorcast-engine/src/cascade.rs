//! The cascade state machine
//!
//! Each step is a value holding its own inputs; a run is a fold over the
//! step list, and resume is restarting the fold at the recorded cursor.
//! GENERATE walks A1→A2→A3, MODIFY walks INGEST→B1→B2→B3, QA is a single
//! exchange, and BATCH delegates to the batch monitor. Temperature is 0.0
//! for every step that produces file content and 0.2 for everything else.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use mirrorcast_capability::CapabilityRecord;
use mirrorcast_config::PricingTable;
use mirrorcast_contract::{
    AssemblyProgress, ChunkAssembler, Contract, ContractError, ContractKind,
    EXPIRED_CHAIN_REASON, parse,
};
use mirrorcast_ledger::{Ledger, Receipt};
use mirrorcast_mirror::{MirrorRequest, mirror};
use mirrorcast_pathsafe::WalkerPolicy;
use mirrorcast_provider::{
    InputSegment, ProviderClient, ProviderError, ResponseEnvelope, ResponsesRequest, Tool,
};
use mirrorcast_runlog::{EventLevel, RunLogger};
use mirrorcast_utils::cancel::CancelFlag;
use mirrorcast_utils::ids::StepKey;
use mirrorcast_utils::types::{RunMode, RunRequest, RunState};

use crate::batch;
use crate::error::RunError;
use crate::event::EventBus;
use crate::supervisor::ContinueGate;
use crate::writer::OutputWriter;

/// Prompt length above which the A0 ingest phase splits and chains it.
pub(crate) const PROMPT_INGEST_THRESHOLD: usize = 150_000;

/// Size of each A0 piece, in characters.
pub(crate) const PROMPT_PIECE_CHARS: usize = 20_000;

/// How long the cascade naps while the circuit breaker is open.
const COOLDOWN_PAUSE: Duration = Duration::from_secs(2);

/// Everything one cascade execution owns.
pub(crate) struct CascadeContext {
    pub request: RunRequest,
    pub caps: CapabilityRecord,
    pub client: Arc<dyn ProviderClient>,
    pub logger: Arc<RunLogger>,
    pub ledger: Arc<Ledger>,
    pub pricing: Option<PricingTable>,
    pub pricing_ttl_days: i64,
    pub events: EventBus,
    pub cancel: CancelFlag,
    pub continue_gate: ContinueGate,
    pub walker_policy: WalkerPolicy,
    pub upload_concurrency: usize,
    pub state: RunState,
    pub writer: Option<OutputWriter>,
}

impl CascadeContext {
    /// The response id the next chained request should reference.
    fn last_response_id(&self) -> Option<String> {
        self.state
            .response_chain
            .last()
            .cloned()
            .or_else(|| self.request.previous_response_id.clone())
    }

    fn prompt_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.request.prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub(crate) fn emit(&self, step: &str, percent: u8, kind: &str, message: impl Into<String>) {
        let event = self.events.emit(step, percent, kind, message);
        self.logger.append_event(
            EventLevel::Info,
            step,
            &event.kind,
            json!({"message": event.message, "percent": event.percent}),
        );
    }
}

/// One step of a cascade, carrying its own inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// MODIFY: mirror the input tree into the Provider.
    Ingest,
    /// A0: feed one oversized-prompt piece into the chain.
    PromptPiece { index: usize, piece: String },
    /// A1 / B1.
    Plan,
    /// A2 / B2.
    Structure,
    /// MODIFY dry-run: halt until the continue signal.
    DryRunGate,
    /// A3 / B3 chunk loops over every planned path.
    Files,
    /// QA single exchange.
    Qa,
    /// BATCH: build the JSONL, upload it, create the batch.
    CreateBatch,
    /// BATCH: poll to terminal, then download, parse, and write.
    PollBatch,
}

impl Step {
    fn label(&self, mode: RunMode) -> String {
        let prefix = match mode {
            RunMode::Generate => "A",
            RunMode::Modify => "B",
            RunMode::Qa | RunMode::Batch => "",
        };
        match self {
            Self::Ingest => "INGEST".to_string(),
            Self::PromptPiece { index, .. } => format!("A0_{index}"),
            Self::Plan => format!("{prefix}1"),
            Self::Structure => format!("{prefix}2"),
            Self::DryRunGate => "DRY_RUN".to_string(),
            Self::Files => format!("{prefix}3"),
            Self::Qa => "QA".to_string(),
            Self::CreateBatch => "BATCH_CREATE".to_string(),
            Self::PollBatch => "BATCH_POLL".to_string(),
        }
    }
}

/// Build the deterministic step list for a request. Resume depends on this
/// being a pure function of the request.
pub(crate) fn build_steps(request: &RunRequest) -> Vec<Step> {
    let mut steps = Vec::new();
    match request.mode {
        RunMode::Generate => {
            push_prompt_pieces(&mut steps, &request.prompt);
            steps.push(Step::Plan);
            steps.push(Step::Structure);
            steps.push(Step::Files);
        }
        RunMode::Modify => {
            steps.push(Step::Ingest);
            push_prompt_pieces(&mut steps, &request.prompt);
            steps.push(Step::Plan);
            steps.push(Step::Structure);
            if request.flags.dry_run {
                steps.push(Step::DryRunGate);
            }
            steps.push(Step::Files);
        }
        RunMode::Qa => steps.push(Step::Qa),
        RunMode::Batch => {
            steps.push(Step::CreateBatch);
            steps.push(Step::PollBatch);
        }
    }
    steps
}

fn push_prompt_pieces(steps: &mut Vec<Step>, prompt: &str) {
    if prompt.chars().count() <= PROMPT_INGEST_THRESHOLD {
        return;
    }
    let chars: Vec<char> = prompt.chars().collect();
    for (index, piece) in chars.chunks(PROMPT_PIECE_CHARS).enumerate() {
        steps.push(Step::PromptPiece {
            index,
            piece: piece.iter().collect(),
        });
    }
}

/// Execute (or resume) a cascade. The caller owns terminal-state writing.
pub(crate) async fn execute(ctx: &mut CascadeContext) -> Result<(), RunError> {
    let steps = build_steps(&ctx.request);
    let total = steps.len() as u32;

    for (index, step) in steps.iter().enumerate() {
        let index = index as u32;
        if index < ctx.state.cursor {
            debug!(step = %step.label(ctx.request.mode), "skipping completed step on resume");
            continue;
        }
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let label = step.label(ctx.request.mode);
        let percent = (index * 100 / total.max(1)) as u8;
        ctx.emit(&label, percent, "step_started", format!("step {label}"));

        run_step(ctx, step, &label).await?;

        ctx.state.advance_cursor(index + 1);
        ctx.logger.write_state(&ctx.state);
        let done_percent = ((index + 1) * 100 / total.max(1)) as u8;
        ctx.emit(&label, done_percent, "step_done", format!("step {label} done"));
    }
    Ok(())
}

async fn run_step(ctx: &mut CascadeContext, step: &Step, label: &str) -> Result<(), RunError> {
    match step {
        Step::Ingest => run_ingest(ctx).await,
        Step::PromptPiece { index, piece } => run_prompt_piece(ctx, *index, piece).await,
        Step::Plan => run_plan(ctx, label).await,
        Step::Structure => run_structure(ctx, label).await,
        Step::DryRunGate => run_dry_run_gate(ctx).await,
        Step::Files => run_files(ctx, label).await,
        Step::Qa => run_qa(ctx).await,
        Step::CreateBatch => batch::create_batch_step(ctx).await,
        Step::PollBatch => batch::poll_batch_step(ctx).await,
    }
}

// ---------------------------------------------------------------------------
// Request construction
// ---------------------------------------------------------------------------

/// The hard output rules, stated in instructions AND restated in input.
fn output_rules(kind: ContractKind) -> String {
    format!(
        "OUTPUT RULES:\n\
         - Respond with exactly one JSON object and nothing else.\n\
         - The top-level field \"contract\" must be \"{kind}\".\n\
         - No markdown fences, no prose, no comments, no explanation.\n\
         {}",
        contract_schema(kind)
    )
}

fn contract_schema(kind: ContractKind) -> &'static str {
    match kind {
        ContractKind::A1Plan | ContractKind::B1Plan => {
            "- Required fields: \"plan\" (non-empty array of strings), optional \"notes\" (string)."
        }
        ContractKind::A2Structure => {
            "- Required fields: \"files\" (non-empty array of {\"path\", optional \"purpose\"}).\n\
             - Every path is relative, forward slashes only, no \"..\", unique."
        }
        ContractKind::B2Structure => {
            "- Required fields: \"touched_files\" (non-empty array of {\"path\", \"action\": create|modify|delete, optional \"reason\"}).\n\
             - Every path is relative, forward slashes only, no \"..\", unique."
        }
        ContractKind::A3File | ContractKind::B3File => {
            "- Required fields: \"path\" (string), \"content\" (string), \"chunking\" {\"max_lines\": 500, \"chunk_index\", \"chunk_count\", \"has_more\", optional \"next_chunk_index\"}.\n\
             - Content above 500 lines must be split into chunks; \"has_more\" must equal chunk_index + 1 < chunk_count."
        }
        ContractKind::CFilesAll => {
            "- Required fields: \"files\" (non-empty array of {\"path\", \"content\"}).\n\
             - Every path is relative, forward slashes only, no \"..\", unique."
        }
    }
}

fn temperature_for(kind: Option<ContractKind>) -> f32 {
    match kind {
        // File content is produced deterministically.
        Some(ContractKind::A3File | ContractKind::B3File | ContractKind::CFilesAll) => 0.0,
        _ => 0.2,
    }
}

/// Every provider file id the run must reference: mirrored files, the
/// manifest, and explicit attachments from the request.
fn attached_file_ids(ctx: &CascadeContext) -> Vec<String> {
    let mut ids: Vec<String> = ctx
        .state
        .uploaded
        .values()
        .map(|file| file.file_id.clone())
        .collect();
    if let Some(manifest_id) = &ctx.state.manifest_file_id {
        ids.push(manifest_id.clone());
    }
    ids.extend(ctx.request.attached_file_ids.iter().cloned());
    ids
}

fn file_listing_text(ctx: &CascadeContext) -> String {
    let ids = attached_file_ids(ctx);
    if ids.is_empty() {
        return String::new();
    }
    let mut lines =
        vec!["Attached input files (also provided as input parts):".to_string()];
    for (rel_path, file) in &ctx.state.uploaded {
        lines.push(format!("- {} => {}", rel_path, file.file_id));
    }
    if let Some(manifest_id) = &ctx.state.manifest_file_id {
        lines.push(format!("- manifest.json => {manifest_id}"));
    }
    for extra in &ctx.request.attached_file_ids {
        lines.push(format!("- (attached) => {extra}"));
    }
    lines.join("\n")
}

/// Assemble a request. The contract and the attached files are each stated
/// twice (instructions and input) so the material survives models that
/// ignore one channel.
pub(crate) fn build_request(
    ctx: &CascadeContext,
    step_key: &StepKey,
    kind: Option<ContractKind>,
    body: &str,
) -> ResponsesRequest {
    let role = match ctx.request.mode {
        RunMode::Generate => "You are generating a complete project from scratch.",
        RunMode::Modify => "You are modifying an existing source tree mirrored into your files.",
        RunMode::Qa => "You are answering a question about the provided material.",
        RunMode::Batch => "You are generating a complete project in one batched response.",
    };

    let mut instruction_parts = vec![role.to_string()];
    if let Some(kind) = kind {
        instruction_parts.push(output_rules(kind));
    }
    let listing = file_listing_text(ctx);
    if !listing.is_empty() {
        instruction_parts.push(listing);
    }

    let mut request = ResponsesRequest::new(
        ctx.request.model.clone(),
        instruction_parts.join("\n\n"),
    )
    .with_idempotency(&ctx.state.run_id, step_key.as_str());

    // Restate the contract in the input channel.
    let mut input_text = String::new();
    if let Some(kind) = kind {
        input_text.push_str(&output_rules(kind));
        input_text.push_str("\n\n");
    }
    input_text.push_str(body);
    request.input.push(InputSegment::InputText { text: input_text });

    for file_id in attached_file_ids(ctx) {
        request.input.push(InputSegment::InputFile { file_id });
    }

    if let Some(vs_id) = &ctx.state.vector_store_id
        && ctx.caps.supports_file_search
    {
        request.tools.push(Tool::FileSearch {
            vector_store_ids: vec![vs_id.clone()],
        });
    }

    if ctx.caps.supports_temperature {
        request = request.with_temperature(temperature_for(kind));
    }
    if ctx.caps.supports_previous_response {
        request.previous_response_id = ctx.last_response_id();
    }

    request
}

// ---------------------------------------------------------------------------
// Sending and accounting
// ---------------------------------------------------------------------------

/// Send one request: logs both artifacts, pauses while the breaker is
/// open, maps expired chains to a distinct contract error, appends the
/// response to the chain, and records the receipt.
pub(crate) async fn send(
    ctx: &mut CascadeContext,
    step_key: &StepKey,
    request: ResponsesRequest,
    contract_for_errors: &str,
) -> Result<ResponseEnvelope, RunError> {
    ctx.logger
        .write_request(step_key, &serde_json::to_value(&request).unwrap_or_default());

    let envelope = loop {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        match ctx.client.create_response(request.clone()).await {
            Ok(envelope) => break envelope,
            Err(ProviderError::CoolingDown) => {
                ctx.emit(
                    step_key.as_str(),
                    0,
                    "cooling_down",
                    "provider cooling down; run paused",
                );
                sleep_cancellable(&ctx.cancel, COOLDOWN_PAUSE).await?;
            }
            Err(ProviderError::Cancelled) => return Err(RunError::Cancelled),
            Err(error) if error.is_expired_chain() => {
                return Err(RunError::Contract(ContractError {
                    contract: contract_for_errors.to_string(),
                    pointer: "/previous_response_id".to_string(),
                    reason: EXPIRED_CHAIN_REASON.to_string(),
                }));
            }
            Err(error) => return Err(error.into()),
        }
    };

    ctx.logger.write_response(
        step_key,
        &serde_json::to_value(&envelope).unwrap_or_default(),
    );
    ctx.state.push_response(envelope.id.clone());

    if let Some(usage) = envelope.usage {
        record_receipt(
            ctx,
            step_key,
            Some(envelope.id.clone()),
            None,
            usage.input_tokens,
            usage.output_tokens,
        );
    }

    Ok(envelope)
}

/// Record one receipt; duplicates (resume replays) are ignored by the
/// ledger's primary key.
pub(crate) fn record_receipt(
    ctx: &CascadeContext,
    step_key: &StepKey,
    response_id: Option<String>,
    batch_id: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
) {
    let batch = ctx.request.mode == RunMode::Batch;
    let fresh_pricing = ctx
        .pricing
        .as_ref()
        .filter(|table| !table.is_stale(ctx.pricing_ttl_days));
    let cost = fresh_pricing
        .and_then(|table| table.price(&ctx.request.model, input_tokens, output_tokens, batch));
    let cost_estimated = cost.is_none();

    let receipt = Receipt {
        run_id: ctx.state.run_id.clone(),
        step_key: step_key.to_string(),
        response_id,
        batch_id,
        model: ctx.request.model.clone(),
        mode: ctx.request.mode.to_string(),
        project: ctx.request.project.clone(),
        prompt_digest: Some(ctx.prompt_digest()),
        input_tokens,
        output_tokens,
        tool_usage: None,
        storage_bytes_time: None,
        cost,
        cost_estimated,
        recorded_at: chrono::Utc::now(),
    };
    if let Err(error) = ctx.ledger.record(&receipt) {
        warn!(error = %error, "failed to record receipt");
    }
}

pub(crate) async fn sleep_cancellable(
    cancel: &CancelFlag,
    duration: Duration,
) -> Result<(), RunError> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(RunError::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn run_ingest(ctx: &mut CascadeContext) -> Result<(), RunError> {
    let input_root = ctx
        .request
        .input_root
        .clone()
        .ok_or_else(|| RunError::Storage("MODIFY run without input root".to_string()))?;

    let outcome = mirror(
        Arc::clone(&ctx.client),
        MirrorRequest {
            run_id: &ctx.state.run_id,
            project: ctx.request.project.as_deref(),
            input_root: &input_root,
            policy: &ctx.walker_policy,
            supports_file_search: ctx.caps.supports_file_search,
            concurrency: ctx.upload_concurrency,
            cancel: ctx.cancel.clone(),
        },
    )
    .await?;

    ctx.logger
        .write_manifest(&ctx.state.run_id, &outcome.manifest.to_value());
    ctx.state.uploaded = outcome.uploaded.clone();
    ctx.state.manifest_file_id = outcome.manifest_file_id.clone();
    ctx.state.vector_store_id = outcome.vector_store_id.clone();

    ctx.emit(
        "INGEST",
        0,
        "mirror_done",
        format!(
            "{} files uploaded, vector store {}",
            outcome.manifest.uploaded_count(),
            outcome.vector_store_id.as_deref().unwrap_or("none")
        ),
    );
    Ok(())
}

async fn run_prompt_piece(
    ctx: &mut CascadeContext,
    index: usize,
    piece: &str,
) -> Result<(), RunError> {
    let step_key = StepKey::ingest(index);
    let body = format!(
        "PROMPT PART {index}. Store this content; do not act on it yet. \
         Reply with the single word: received.\n\n{piece}"
    );
    let request = build_request(ctx, &step_key, None, &body);
    send(ctx, &step_key, request, "A0").await?;
    Ok(())
}

async fn run_plan(ctx: &mut CascadeContext, label: &str) -> Result<(), RunError> {
    let kind = match ctx.request.mode {
        RunMode::Modify => ContractKind::B1Plan,
        _ => ContractKind::A1Plan,
    };
    let step_key = StepKey::new(label);
    let body = format!("TASK:\n{}", ctx.request.prompt);
    let request = build_request(ctx, &step_key, Some(kind), &body);
    let envelope = send(ctx, &step_key, request, kind.as_str()).await?;

    let contract = parse_or_quarantine(ctx, &step_key, kind, &envelope.output_text)?;
    if let Contract::Plan(plan) = contract {
        ctx.emit(
            label,
            0,
            "plan_ready",
            format!("{} plan steps", plan.plan.len()),
        );
    }
    Ok(())
}

async fn run_structure(ctx: &mut CascadeContext, label: &str) -> Result<(), RunError> {
    let kind = match ctx.request.mode {
        RunMode::Modify => ContractKind::B2Structure,
        _ => ContractKind::A2Structure,
    };
    let step_key = StepKey::new(label);
    let body = match kind {
        ContractKind::B2Structure => {
            "List every file you will create, modify, or delete to accomplish the task."
        }
        _ => "List every file the finished project will contain.",
    };
    let request = build_request(ctx, &step_key, Some(kind), body);
    let envelope = send(ctx, &step_key, request, kind.as_str()).await?;

    let contract = parse_or_quarantine(ctx, &step_key, kind, &envelope.output_text)?;
    match contract {
        Contract::Structure(structure) => {
            let mut paths: Vec<String> =
                structure.files.into_iter().map(|entry| entry.path).collect();
            paths.sort();
            ctx.state.planned_paths = paths;
            ctx.state.planned_deletes = Vec::new();
        }
        Contract::TouchPlan(touch_plan) => {
            let mut paths = Vec::new();
            let mut deletes = Vec::new();
            for touched in touch_plan.touched_files {
                match touched.action {
                    mirrorcast_contract::TouchAction::Delete => deletes.push(touched.path),
                    _ => paths.push(touched.path),
                }
            }
            paths.sort();
            deletes.sort();
            ctx.state.planned_paths = paths;
            ctx.state.planned_deletes = deletes;
        }
        _ => unreachable!("structure step parses structure contracts only"),
    }

    ctx.emit(
        label,
        0,
        "structure_ready",
        format!(
            "{} paths planned, {} deletions",
            ctx.state.planned_paths.len(),
            ctx.state.planned_deletes.len()
        ),
    );
    Ok(())
}

async fn run_dry_run_gate(ctx: &mut CascadeContext) -> Result<(), RunError> {
    ctx.emit(
        "DRY_RUN",
        0,
        "dry_run_halt",
        format!(
            "dry run: would touch {} paths ({} deletions); waiting for continue",
            ctx.state.planned_paths.len(),
            ctx.state.planned_deletes.len()
        ),
    );
    tokio::select! {
        () = ctx.continue_gate.opened() => Ok(()),
        () = ctx.cancel.cancelled() => Err(RunError::Cancelled),
    }
}

async fn run_files(ctx: &mut CascadeContext, label: &str) -> Result<(), RunError> {
    let deletes = ctx.state.planned_deletes.clone();
    for rel_path in &deletes {
        let writer = ctx
            .writer
            .as_mut()
            .ok_or_else(|| RunError::Storage("file step without output root".to_string()))?;
        match writer.delete_file(rel_path) {
            Ok(()) => ctx.emit(label, 0, "file_deleted", rel_path.clone()),
            Err(error) if error.is_path_scoped() => {
                ctx.emit(label, 0, "path_failed", format!("{rel_path}: {error}"));
            }
            Err(error) => return Err(error),
        }
    }

    // Lexical order makes resume trivially idempotent.
    let paths = ctx.state.planned_paths.clone();
    let mut failed_paths = 0_usize;
    for rel_path in &paths {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        match run_path_chunks(ctx, label, rel_path).await {
            Ok(()) => ctx.emit(label, 0, "file_written", rel_path.clone()),
            Err(error) if error.is_path_scoped() => {
                // This path is dead; the rest of the run continues.
                failed_paths += 1;
                warn!(path = rel_path, error = %error, "path failed; continuing");
                ctx.emit(label, 0, "path_failed", format!("{rel_path}: {error}"));
            }
            Err(error) => return Err(error),
        }
    }

    if failed_paths > 0 {
        ctx.emit(
            label,
            0,
            "paths_partial",
            format!("{failed_paths} of {} paths failed", paths.len()),
        );
    }
    Ok(())
}

async fn run_path_chunks(
    ctx: &mut CascadeContext,
    label: &str,
    rel_path: &str,
) -> Result<(), RunError> {
    let kind = match ctx.request.mode {
        RunMode::Modify => ContractKind::B3File,
        _ => ContractKind::A3File,
    };
    let mut assembler = ChunkAssembler::new(rel_path);
    let mut chunk_index: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let step_key = StepKey::file_chunk(label, rel_path, chunk_index);
        let body = format!(
            "Produce the content of file '{rel_path}'.\nCHUNK_INDEX = {chunk_index}.\n\
             If the remaining content exceeds {} lines, split it and set has_more.",
            mirrorcast_contract::MAX_CHUNK_LINES
        );
        let request = build_request(ctx, &step_key, Some(kind), &body);
        let envelope = send(ctx, &step_key, request, kind.as_str()).await?;

        let contract = parse_or_quarantine(ctx, &step_key, kind, &envelope.output_text)?;
        let Contract::FileChunk(chunk) = contract else {
            unreachable!("file step parses file contracts only");
        };

        match assembler.push(&chunk) {
            Ok(AssemblyProgress::Complete(bytes)) => {
                let writer = ctx
                    .writer
                    .as_mut()
                    .ok_or_else(|| RunError::Storage("file step without output root".to_string()))?;
                writer.write_file(rel_path, &bytes)?;
                return Ok(());
            }
            Ok(AssemblyProgress::NeedsChunk(next)) => {
                // The next chunk chains on this one's response id, which
                // send() already pushed onto the chain.
                chunk_index = next;
            }
            Err(error) => {
                quarantine(ctx, &step_key, &envelope.output_text);
                return Err(error.into());
            }
        }
    }
}

async fn run_qa(ctx: &mut CascadeContext) -> Result<(), RunError> {
    let step_key = StepKey::new("QA");
    let body = format!("QUESTION:\n{}", ctx.request.prompt);
    let request = build_request(ctx, &step_key, None, &body);
    let envelope = send(ctx, &step_key, request, "QA").await?;
    ctx.emit("QA", 0, "qa_answer", envelope.output_text);
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_or_quarantine(
    ctx: &mut CascadeContext,
    step_key: &StepKey,
    kind: ContractKind,
    raw: &str,
) -> Result<Contract, RunError> {
    match parse(kind, raw) {
        Ok(contract) => Ok(contract),
        Err(error) => {
            quarantine(ctx, step_key, raw);
            Err(error.into())
        }
    }
}

pub(crate) fn quarantine(ctx: &CascadeContext, step_key: &StepKey, raw: &str) {
    if let Some(writer) = &ctx.writer {
        writer.quarantine(step_key, raw);
    } else {
        warn!(step = %step_key, "no output root; dropping quarantined response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorcast_utils::types::RunFlags;

    fn request(mode: RunMode, prompt: &str) -> RunRequest {
        RunRequest {
            mode,
            project: None,
            model: "omni-medium".to_string(),
            prompt: prompt.to_string(),
            previous_response_id: None,
            input_root: None,
            output_root: None,
            attached_file_ids: Vec::new(),
            flags: RunFlags::default(),
        }
    }

    #[test]
    fn test_generate_steps_in_order() {
        let steps = build_steps(&request(RunMode::Generate, "make a script"));
        assert_eq!(steps, vec![Step::Plan, Step::Structure, Step::Files]);
    }

    #[test]
    fn test_modify_steps_include_ingest_and_optional_gate() {
        let mut req = request(RunMode::Modify, "change it");
        let steps = build_steps(&req);
        assert_eq!(
            steps,
            vec![Step::Ingest, Step::Plan, Step::Structure, Step::Files]
        );

        req.flags.dry_run = true;
        let steps = build_steps(&req);
        assert!(steps.contains(&Step::DryRunGate));
        let gate_pos = steps.iter().position(|s| *s == Step::DryRunGate).unwrap();
        let files_pos = steps.iter().position(|s| *s == Step::Files).unwrap();
        assert!(gate_pos < files_pos);
    }

    #[test]
    fn test_prompt_at_threshold_does_not_chunk() {
        let prompt = "x".repeat(PROMPT_INGEST_THRESHOLD);
        let steps = build_steps(&request(RunMode::Generate, &prompt));
        assert!(
            !steps
                .iter()
                .any(|step| matches!(step, Step::PromptPiece { .. }))
        );
    }

    #[test]
    fn test_prompt_over_threshold_chunks_into_pieces() {
        let prompt = "x".repeat(PROMPT_INGEST_THRESHOLD + 1);
        let steps = build_steps(&request(RunMode::Generate, &prompt));
        let pieces: Vec<&Step> = steps
            .iter()
            .filter(|step| matches!(step, Step::PromptPiece { .. }))
            .collect();
        // ceil(150_001 / 20_000) = 8 pieces; the tail holds the remainder.
        assert_eq!(pieces.len(), 8);
        if let Step::PromptPiece { index, piece } = pieces[7] {
            assert_eq!(*index, 7);
            assert_eq!(piece.chars().count(), 10_001);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn test_qa_and_batch_step_lists() {
        assert_eq!(build_steps(&request(RunMode::Qa, "why")), vec![Step::Qa]);
        assert_eq!(
            build_steps(&request(RunMode::Batch, "all of it")),
            vec![Step::CreateBatch, Step::PollBatch]
        );
    }

    #[test]
    fn test_step_labels_follow_mode() {
        assert_eq!(Step::Plan.label(RunMode::Generate), "A1");
        assert_eq!(Step::Plan.label(RunMode::Modify), "B1");
        assert_eq!(Step::Files.label(RunMode::Modify), "B3");
        assert_eq!(Step::Qa.label(RunMode::Qa), "QA");
    }

    #[test]
    fn test_temperature_policy() {
        assert_eq!(temperature_for(Some(ContractKind::A3File)), 0.0);
        assert_eq!(temperature_for(Some(ContractKind::B3File)), 0.0);
        assert_eq!(temperature_for(Some(ContractKind::CFilesAll)), 0.0);
        assert_eq!(temperature_for(Some(ContractKind::A1Plan)), 0.2);
        assert_eq!(temperature_for(None), 0.2);
    }
}
