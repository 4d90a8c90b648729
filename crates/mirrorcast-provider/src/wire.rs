//! Wire types for the Provider API
//!
//! The request shape mirrors the Provider's stateful Responses endpoint:
//! instructions plus a list of input segments (text or attached file), an
//! optional `file_search` tool, optional chaining via
//! `previous_response_id`, and a bounded temperature. The idempotency
//! token never serializes into the body; it travels as a header.

use serde::{Deserialize, Serialize};

/// One model known to the Provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub created: Option<i64>,
}

/// One input segment of a Responses request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSegment {
    InputText { text: String },
    InputFile { file_id: String },
}

/// Tools the orchestrator can request. Only `file_search` exists today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
    FileSearch { vector_store_ids: Vec<String> },
}

/// A fully-specified Responses request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub instructions: String,
    pub input: Vec<InputSegment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Derived from `(run_id, step_key)`; sent as the `Idempotency-Key`
    /// header, never serialized into the body.
    #[serde(skip)]
    pub idempotency_key: String,
}

impl ResponsesRequest {
    /// Start a request with mandatory fields.
    #[must_use]
    pub fn new(model: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            instructions: instructions.into(),
            input: Vec::new(),
            tools: Vec::new(),
            previous_response_id: None,
            temperature: None,
            idempotency_key: String::new(),
        }
    }

    /// Set the temperature, clamped into the supported `[0.0, 0.2]` band.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 0.2));
        self
    }

    /// Derive the idempotency token that makes retries safe.
    #[must_use]
    pub fn with_idempotency(mut self, run_id: &str, step_key: &str) -> Self {
        self.idempotency_key = format!("{run_id}:{step_key}");
        self
    }
}

/// Token usage reported by the Provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A completed response, flattened to what the cascade consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub status: Option<String>,
    /// All text output concatenated in order.
    pub output_text: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// A file the Provider holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFile {
    pub file_id: String,
    pub purpose: String,
    pub bytes: u64,
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// A vector store and its attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreInfo {
    pub vs_id: String,
    pub name: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Async batch status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: String,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
}

impl BatchStatus {
    /// Statuses after which the batch will never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "completed" | "failed" | "cancelled" | "expired"
        )
    }

    /// An open batch is anything not terminal.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}
