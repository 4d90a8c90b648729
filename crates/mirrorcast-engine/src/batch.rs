//! Batch monitor
//!
//! BATCH mode writes a one-line JSONL carrying a single Responses request
//! with the `C_FILES_ALL` contract, uploads it, creates the batch, and
//! polls with backoff (5s floor, 60s ceiling) until a terminal status. A
//! completed batch is downloaded, contract-parsed, and written through the
//! same output gate as interactive runs; a failed one persists its error
//! file and records a zero-token receipt.

use serde_json::{Value, json};
use std::time::Duration;
use tracing::warn;

use mirrorcast_contract::{Contract, ContractKind, FilesAllContract};
use mirrorcast_provider::{BatchStatus, ProviderClient, ProviderError, Usage};
use mirrorcast_utils::ids::StepKey;

use crate::cascade::{
    CascadeContext, build_request, parse_or_quarantine, record_receipt, sleep_cancellable,
};
use crate::error::RunError;

/// Poll interval floor and ceiling.
const POLL_MIN: Duration = Duration::from_secs(5);
const POLL_MAX: Duration = Duration::from_secs(60);

/// Upload purpose for batch input files.
const BATCH_PURPOSE: &str = "batch";

/// Build the JSONL, upload it, and create the batch.
pub(crate) async fn create_batch_step(ctx: &mut CascadeContext) -> Result<(), RunError> {
    if ctx.state.batch_id.is_some() {
        // Resume landed after creation; nothing to redo.
        return Ok(());
    }

    let step_key = StepKey::new("C_FILES_ALL");
    let request = build_request(
        ctx,
        &step_key,
        Some(ContractKind::CFilesAll),
        &format!("TASK:\n{}", ctx.request.prompt),
    );

    let line = json!({
        "custom_id": ctx.state.run_id,
        "method": "POST",
        "url": "/v1/responses",
        "body": serde_json::to_value(&request).unwrap_or_default(),
    });
    ctx.logger.write_request(&step_key, &line);
    ctx.emit("BATCH_CREATE", 0, "batch_jsonl_built", "batch input assembled");

    let jsonl = format!("{line}\n");
    let pause = PauseHandles::from(&*ctx);
    let client = std::sync::Arc::clone(&ctx.client);
    let file_id = pause
        .run("BATCH_CREATE", || {
            let client = std::sync::Arc::clone(&client);
            let jsonl = jsonl.clone();
            async move {
                client
                    .upload_bytes("batch.jsonl", jsonl.into_bytes(), BATCH_PURPOSE)
                    .await
            }
        })
        .await?;

    let batch_id = pause
        .run("BATCH_CREATE", || {
            let client = std::sync::Arc::clone(&client);
            let file_id = file_id.clone();
            async move { client.create_batch(&file_id).await }
        })
        .await?;

    ctx.state.batch_id = Some(batch_id.clone());
    ctx.emit(
        "BATCH_CREATE",
        0,
        "batch_created",
        format!("batch {batch_id} created"),
    );
    Ok(())
}

/// Poll to terminal, then download, parse, and write the result set.
pub(crate) async fn poll_batch_step(ctx: &mut CascadeContext) -> Result<(), RunError> {
    let batch_id = ctx
        .state
        .batch_id
        .clone()
        .ok_or_else(|| RunError::Storage("batch poll without a batch id".to_string()))?;

    let pause = PauseHandles::from(&*ctx);
    let client = std::sync::Arc::clone(&ctx.client);
    let mut interval = POLL_MIN;
    let status = loop {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let status = pause
            .run("BATCH_POLL", || {
                let client = std::sync::Arc::clone(&client);
                let batch_id = batch_id.clone();
                async move { client.get_batch(&batch_id).await }
            })
            .await?;
        if status.is_terminal() {
            break status;
        }
        ctx.emit(
            "BATCH_POLL",
            0,
            "batch_polling",
            format!("batch {batch_id} is {}", status.status),
        );
        sleep_cancellable(&ctx.cancel, interval).await?;
        interval = (interval * 2).min(POLL_MAX);
    };

    let step_key = StepKey::new("C_FILES_ALL");
    if status.status != "completed" {
        return fail_batch(ctx, &step_key, &batch_id, &status).await;
    }

    let output_file_id = status.output_file_id.clone().ok_or_else(|| {
        RunError::Storage("completed batch carries no output file".to_string())
    })?;
    let bytes = pause
        .run("BATCH_POLL", || {
            let client = std::sync::Arc::clone(&client);
            let output_file_id = output_file_id.clone();
            async move { client.download_file(&output_file_id).await }
        })
        .await?;
    ctx.emit("BATCH_POLL", 0, "batch_result", "batch output downloaded");

    let (files, usage) = parse_batch_output(ctx, &step_key, &bytes)?;
    record_receipt(
        ctx,
        &step_key,
        None,
        Some(batch_id),
        usage.input_tokens,
        usage.output_tokens,
    );

    for file in &files.files {
        if ctx.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let writer = ctx
            .writer
            .as_mut()
            .ok_or_else(|| RunError::Storage("batch write without output root".to_string()))?;
        writer.write_file(&file.path, file.content.as_bytes())?;
        ctx.emit("WRITE_ALL", 0, "file_written", file.path.clone());
    }
    Ok(())
}

async fn fail_batch(
    ctx: &mut CascadeContext,
    step_key: &StepKey,
    batch_id: &str,
    status: &BatchStatus,
) -> Result<(), RunError> {
    if let Some(error_file_id) = &status.error_file_id {
        match ctx.client.download_file(error_file_id).await {
            Ok(bytes) => {
                let raw = String::from_utf8_lossy(&bytes).to_string();
                ctx.logger
                    .write_response(step_key, &json!({"batch_error_file": raw}));
            }
            Err(error) => warn!(error = %error, "failed to download batch error file"),
        }
    }
    // Zero-token receipt so the failed batch is still accounted for.
    record_receipt(ctx, step_key, None, Some(batch_id.to_string()), 0, 0);
    Err(RunError::BatchFailed {
        status: status.status.clone(),
    })
}

/// Parse the downloaded batch output: one JSONL line whose `response.body`
/// is a Responses reply wrapping the `C_FILES_ALL` contract.
fn parse_batch_output(
    ctx: &mut CascadeContext,
    step_key: &StepKey,
    bytes: &[u8],
) -> Result<(FilesAllContract, Usage), RunError> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.lines().find(|line| !line.trim().is_empty()).ok_or_else(|| {
        RunError::Storage("batch output file is empty".to_string())
    })?;

    let parsed: Value = serde_json::from_str(line)
        .map_err(|e| RunError::Storage(format!("batch output line is not JSON: {e}")))?;
    let body = parsed
        .pointer("/response/body")
        .cloned()
        .unwrap_or(parsed.clone());
    ctx.logger.write_response(step_key, &body);

    let usage = body
        .get("usage")
        .and_then(|value| serde_json::from_value::<Usage>(value.clone()).ok())
        .unwrap_or_default();

    let output_text = flatten_output_text(&body);
    let contract = parse_or_quarantine(ctx, step_key, ContractKind::CFilesAll, &output_text)?;
    let Contract::FilesAll(files) = contract else {
        unreachable!("batch parses C_FILES_ALL only");
    };
    Ok((files, usage))
}

fn flatten_output_text(body: &Value) -> String {
    let Some(output) = body.get("output").and_then(Value::as_array) else {
        // Some doubles hand the contract text straight through.
        return body
            .get("output_text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
    };
    let mut text = String::new();
    for item in output {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(Value::as_str) == Some("output_text")
                && let Some(part_text) = part.get("text").and_then(Value::as_str)
            {
                text.push_str(part_text);
            }
        }
    }
    text
}

/// Cancellation and event handles detached from the context, so provider
/// calls can be retried while the breaker is open without borrowing the
/// whole cascade.
struct PauseHandles {
    cancel: mirrorcast_utils::cancel::CancelFlag,
    events: crate::event::EventBus,
}

impl From<&CascadeContext> for PauseHandles {
    fn from(ctx: &CascadeContext) -> Self {
        Self {
            cancel: ctx.cancel.clone(),
            events: ctx.events.clone(),
        }
    }
}

impl PauseHandles {
    /// Retry one provider call while the circuit breaker is open, pausing
    /// the cascade rather than failing it.
    async fn run<T, F, Fut>(&self, step: &str, mut call: F) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(ProviderError::CoolingDown) => {
                    let _ = self.events.emit(
                        step,
                        0,
                        "cooling_down",
                        "provider cooling down; run paused",
                    );
                    sleep_cancellable(&self.cancel, Duration::from_secs(2)).await?;
                }
                Err(ProviderError::Cancelled) => return Err(RunError::Cancelled),
                Err(error) => return Err(error.into()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Standalone batch operations (exposed through the Run API)
// ---------------------------------------------------------------------------

/// All batches not yet in a terminal state.
///
/// # Errors
///
/// Propagates provider failures.
pub async fn list_open_batches(
    client: &dyn ProviderClient,
) -> Result<Vec<BatchStatus>, ProviderError> {
    Ok(client
        .list_batches()
        .await?
        .into_iter()
        .filter(BatchStatus::is_open)
        .collect())
}

/// Cancel one batch.
///
/// # Errors
///
/// Propagates provider failures.
pub async fn cancel_batch(
    client: &dyn ProviderClient,
    batch_id: &str,
) -> Result<(), ProviderError> {
    client.cancel_batch(batch_id).await
}

/// Download the raw result file of a terminal batch, when one exists.
///
/// # Errors
///
/// Propagates provider failures.
pub async fn fetch_batch_result(
    client: &dyn ProviderClient,
    batch_id: &str,
) -> Result<Option<Vec<u8>>, ProviderError> {
    let status = client.get_batch(batch_id).await?;
    match status.output_file_id {
        Some(file_id) => Ok(Some(client.download_file(&file_id).await?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_output_text_from_message_parts() {
        let body = json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"a\":"},
                    {"type": "output_text", "text": "1}"}
                ]}
            ]
        });
        assert_eq!(flatten_output_text(&body), "{\"a\":1}");
    }

    #[test]
    fn test_flatten_output_text_passthrough() {
        let body = json!({"output_text": "{\"contract\":\"C_FILES_ALL\"}"});
        assert_eq!(flatten_output_text(&body), "{\"contract\":\"C_FILES_ALL\"}");
    }
}
