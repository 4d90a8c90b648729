//! Scripted in-memory Provider
//!
//! Test seam; not part of public API stability guarantees. Responses are
//! scripted in order, uploads and batches are tracked, and every request
//! the engine builds is captured for assertions.

use async_trait::async_trait;
use camino::Utf8Path;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use mirrorcast_provider::{
    BatchStatus, ModelInfo, ProviderClient, ProviderError, ProviderFile, ResponseEnvelope,
    ResponsesRequest, Usage, VectorStoreInfo,
};

#[derive(Default)]
struct Inner {
    responses: VecDeque<Result<String, ProviderError>>,
    response_counter: u64,
    upload_counter: u64,
    uploaded_names: Vec<String>,
    files: HashMap<String, Vec<u8>>,
    batch_statuses: VecDeque<BatchStatus>,
    batches_created: Vec<String>,
    vector_stores_created: Vec<String>,
    vector_store_files: Vec<(String, String)>,
    requests_seen: Vec<ResponsesRequest>,
    cancelled_batches: Vec<String>,
}

/// Deterministic, scriptable [`ProviderClient`].
#[derive(Default)]
pub struct ScriptedClient {
    inner: Mutex<Inner>,
}

impl ScriptedClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next `create_response` output text (with default usage).
    pub fn push_response(&self, output_text: impl Into<String>) {
        self.inner
            .lock()
            .unwrap()
            .responses
            .push_back(Ok(output_text.into()));
    }

    /// Queue a `create_response` failure.
    pub fn push_error(&self, error: ProviderError) {
        self.inner.lock().unwrap().responses.push_back(Err(error));
    }

    /// Make a file downloadable by id.
    pub fn set_file(&self, file_id: impl Into<String>, bytes: Vec<u8>) {
        self.inner.lock().unwrap().files.insert(file_id.into(), bytes);
    }

    /// Script the sequence `get_batch` walks through; the last status
    /// repeats forever.
    pub fn script_batch(&self, statuses: Vec<BatchStatus>) {
        self.inner.lock().unwrap().batch_statuses = statuses.into();
    }

    /// Every Responses request the engine sent, in order.
    #[must_use]
    pub fn requests_seen(&self) -> Vec<ResponsesRequest> {
        self.inner.lock().unwrap().requests_seen.clone()
    }

    /// Names of files uploaded, in completion order.
    #[must_use]
    pub fn uploaded_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().uploaded_names.clone()
    }

    /// Vector stores created so far.
    #[must_use]
    pub fn vector_stores_created(&self) -> Vec<String> {
        self.inner.lock().unwrap().vector_stores_created.clone()
    }

    /// `(vs_id, file_id)` attachment pairs.
    #[must_use]
    pub fn vector_store_files(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().vector_store_files.clone()
    }

    /// Batches created so far.
    #[must_use]
    pub fn batches_created(&self) -> Vec<String> {
        self.inner.lock().unwrap().batches_created.clone()
    }

    /// Responses not yet consumed by the engine.
    #[must_use]
    pub fn remaining_responses(&self) -> usize {
        self.inner.lock().unwrap().responses.len()
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        Ok(vec![ModelInfo {
            id: "omni-medium".to_string(),
            created: None,
        }])
    }

    async fn create_response(
        &self,
        request: ResponsesRequest,
    ) -> Result<ResponseEnvelope, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests_seen.push(request.clone());
        let scripted = inner.responses.pop_front().ok_or_else(|| ProviderError::Api {
            status: 500,
            message: "script exhausted: unexpected create_response".to_string(),
        })?;
        let output_text = scripted?;
        inner.response_counter += 1;
        Ok(ResponseEnvelope {
            id: format!("resp_{}", inner.response_counter),
            model: request.model,
            status: Some("completed".to_string()),
            output_text,
            usage: Some(Usage {
                input_tokens: 100,
                output_tokens: 50,
            }),
        })
    }

    async fn upload_file(&self, path: &Utf8Path, _purpose: &str) -> Result<String, ProviderError> {
        let name = path.file_name().unwrap_or_default().to_string();
        self.register_upload(name)
    }

    async fn upload_bytes(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        _purpose: &str,
    ) -> Result<String, ProviderError> {
        let id = self.register_upload(file_name.to_string())?;
        self.inner.lock().unwrap().files.insert(id.clone(), bytes);
        Ok(id)
    }

    async fn list_files(&self) -> Result<Vec<ProviderFile>, ProviderError> {
        Ok(Vec::new())
    }

    async fn delete_file(&self, _file_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: format!("no such file: {file_id}"),
            })
    }

    async fn create_vector_store(&self, name: &str) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let vs_id = format!("vs_{}", inner.vector_stores_created.len() + 1);
        inner.vector_stores_created.push(name.to_string());
        Ok(vs_id)
    }

    async fn list_vector_stores(&self) -> Result<Vec<VectorStoreInfo>, ProviderError> {
        Ok(Vec::new())
    }

    async fn delete_vector_store(&self, _vs_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn add_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
        _attributes: serde_json::Value,
    ) -> Result<(), ProviderError> {
        self.inner
            .lock()
            .unwrap()
            .vector_store_files
            .push((vs_id.to_string(), file_id.to_string()));
        Ok(())
    }

    async fn remove_vector_store_file(
        &self,
        _vs_id: &str,
        _file_id: &str,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn set_vector_store_expiration(
        &self,
        _vs_id: &str,
        _days: u32,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn create_batch(&self, jsonl_file_id: &str) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.files.contains_key(jsonl_file_id),
            "batch created from an unknown input file"
        );
        let batch_id = format!("batch_{}", inner.batches_created.len() + 1);
        inner.batches_created.push(batch_id.clone());
        Ok(batch_id)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchStatus, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.batch_statuses.len() > 1 {
            Ok(inner.batch_statuses.pop_front().expect("checked non-empty"))
        } else {
            inner
                .batch_statuses
                .front()
                .cloned()
                .ok_or_else(|| ProviderError::Api {
                    status: 404,
                    message: format!("no such batch: {batch_id}"),
                })
        }
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), ProviderError> {
        self.inner
            .lock()
            .unwrap()
            .cancelled_batches
            .push(batch_id.to_string());
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<BatchStatus>, ProviderError> {
        Ok(self.inner.lock().unwrap().batch_statuses.iter().cloned().collect())
    }
}

impl ScriptedClient {
    fn register_upload(&self, name: String) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.upload_counter += 1;
        inner.uploaded_names.push(name);
        Ok(format!("file_{}", inner.upload_counter))
    }
}
