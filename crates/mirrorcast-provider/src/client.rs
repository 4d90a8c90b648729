//! The typed client capability
//!
//! `ProviderClient` is the narrow surface the mirror uploader, capability
//! probe, cascade, and batch monitor consume. The HTTP implementation maps
//! each operation onto the Provider's REST endpoints through the
//! transport; test doubles script the same trait in memory.

use async_trait::async_trait;
use camino::Utf8Path;
use mirrorcast_redaction::redact_error_message;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tracing::debug;

use crate::error::ProviderError;
use crate::transport::Transport;
use crate::wire::{
    BatchStatus, ModelInfo, ProviderFile, ResponseEnvelope, ResponsesRequest, Usage,
    VectorStoreInfo,
};

/// Narrow, typed operations over the Provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;
    async fn create_response(
        &self,
        request: ResponsesRequest,
    ) -> Result<ResponseEnvelope, ProviderError>;

    async fn upload_file(&self, path: &Utf8Path, purpose: &str) -> Result<String, ProviderError>;
    async fn upload_bytes(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        purpose: &str,
    ) -> Result<String, ProviderError>;
    async fn list_files(&self) -> Result<Vec<ProviderFile>, ProviderError>;
    async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError>;
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ProviderError>;

    async fn create_vector_store(&self, name: &str) -> Result<String, ProviderError>;
    async fn list_vector_stores(&self) -> Result<Vec<VectorStoreInfo>, ProviderError>;
    async fn delete_vector_store(&self, vs_id: &str) -> Result<(), ProviderError>;
    async fn add_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
        attributes: serde_json::Value,
    ) -> Result<(), ProviderError>;
    async fn remove_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
    ) -> Result<(), ProviderError>;
    async fn set_vector_store_expiration(
        &self,
        vs_id: &str,
        days: u32,
    ) -> Result<(), ProviderError>;

    async fn create_batch(&self, jsonl_file_id: &str) -> Result<String, ProviderError>;
    async fn get_batch(&self, batch_id: &str) -> Result<BatchStatus, ProviderError>;
    async fn cancel_batch(&self, batch_id: &str) -> Result<(), ProviderError>;
    async fn list_batches(&self) -> Result<Vec<BatchStatus>, ProviderError>;
}

/// HTTP implementation over the reliability transport.
pub struct HttpProviderClient {
    transport: Transport,
    base_url: String,
    api_key: String,
}

impl HttpProviderClient {
    /// Build a client for one endpoint and key.
    #[must_use]
    pub fn new(transport: Transport, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            transport,
            base_url,
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<T, ProviderError> {
        response.json::<T>().await.map_err(|e| ProviderError::Transport {
            message: redact_error_message(&format!("failed to decode {operation} response: {e}")),
        })
    }
}

/// Raw shape of a Responses-endpoint reply before flattening.
#[derive(Debug, Deserialize)]
struct RawResponse {
    id: String,
    model: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<RawOutputItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct RawOutputItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<RawContentPart>,
}

#[derive(Debug, Deserialize)]
struct RawContentPart {
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl RawResponse {
    fn flatten(self) -> ResponseEnvelope {
        let mut output_text = String::new();
        for item in &self.output {
            if item.item_type != "message" {
                continue;
            }
            for part in &item.content {
                if part.part_type == "output_text"
                    && let Some(text) = &part.text
                {
                    output_text.push_str(text);
                }
            }
        }
        ResponseEnvelope {
            id: self.id,
            model: self.model,
            status: self.status,
            output_text,
            usage: self.usage,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Listing<T> {
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    id: String,
    status: String,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
}

impl From<RawBatch> for BatchStatus {
    fn from(raw: RawBatch) -> Self {
        Self {
            batch_id: raw.id,
            status: raw.status,
            output_file_id: raw.output_file_id,
            error_file_id: raw.error_file_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVectorStore {
    id: String,
    name: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let request = self.authed(self.transport.http().get(self.url("/models")));
        let response = self.transport.execute(request, "list_models").await?;
        let listing: Listing<ModelInfo> = Self::decode(response, "list_models").await?;
        Ok(listing.data)
    }

    async fn create_response(
        &self,
        request: ResponsesRequest,
    ) -> Result<ResponseEnvelope, ProviderError> {
        debug!(
            model = %request.model,
            segments = request.input.len(),
            chained = request.previous_response_id.is_some(),
            "creating response"
        );
        let http = self
            .authed(self.transport.http().post(self.url("/responses")))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&request);
        let response = self.transport.execute(http, "create_response").await?;
        let raw: RawResponse = Self::decode(response, "create_response").await?;
        Ok(raw.flatten())
    }

    async fn upload_file(&self, path: &Utf8Path, purpose: &str) -> Result<String, ProviderError> {
        let bytes = fs::read(path.as_std_path())
            .await
            .map_err(|e| ProviderError::Transport {
                message: redact_error_message(&format!("failed to read upload source: {e}")),
            })?;
        let file_name = path.file_name().unwrap_or("upload.bin").to_string();
        self.upload_bytes(&file_name, bytes, purpose).await
    }

    async fn upload_bytes(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        purpose: &str,
    ) -> Result<String, ProviderError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", purpose.to_string())
            .part("file", part);
        let request = self
            .authed(self.transport.http().post(self.url("/files")))
            .multipart(form);
        // Multipart bodies are not replayable, so upload failures surface
        // without transport-level retries; the uploader marks the entry
        // and moves on.
        let response = self.transport.execute(request, "upload_file").await?;
        let id: IdOnly = Self::decode(response, "upload_file").await?;
        Ok(id.id)
    }

    async fn list_files(&self) -> Result<Vec<ProviderFile>, ProviderError> {
        #[derive(Debug, Deserialize)]
        struct RawFile {
            id: String,
            #[serde(default)]
            purpose: String,
            #[serde(default)]
            bytes: u64,
            #[serde(default)]
            created_at: Option<i64>,
        }
        let request = self.authed(self.transport.http().get(self.url("/files")));
        let response = self.transport.execute(request, "list_files").await?;
        let listing: Listing<RawFile> = Self::decode(response, "list_files").await?;
        Ok(listing
            .data
            .into_iter()
            .map(|raw| ProviderFile {
                file_id: raw.id,
                purpose: raw.purpose,
                bytes: raw.bytes,
                created_at: raw.created_at,
            })
            .collect())
    }

    async fn delete_file(&self, file_id: &str) -> Result<(), ProviderError> {
        let request = self.authed(
            self.transport
                .http()
                .delete(self.url(&format!("/files/{file_id}"))),
        );
        self.transport.execute(request, "delete_file").await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        let request = self.authed(
            self.transport
                .http()
                .get(self.url(&format!("/files/{file_id}/content"))),
        );
        let response = self.transport.execute(request, "download_file").await?;
        let bytes = response.bytes().await.map_err(|e| ProviderError::Transport {
            message: redact_error_message(&format!("failed to read file content: {e}")),
        })?;
        Ok(bytes.to_vec())
    }

    async fn create_vector_store(&self, name: &str) -> Result<String, ProviderError> {
        let request = self
            .authed(self.transport.http().post(self.url("/vector_stores")))
            .json(&json!({"name": name}));
        let response = self.transport.execute(request, "create_vector_store").await?;
        let id: IdOnly = Self::decode(response, "create_vector_store").await?;
        Ok(id.id)
    }

    async fn list_vector_stores(&self) -> Result<Vec<VectorStoreInfo>, ProviderError> {
        let request = self.authed(self.transport.http().get(self.url("/vector_stores")));
        let response = self.transport.execute(request, "list_vector_stores").await?;
        let listing: Listing<RawVectorStore> =
            Self::decode(response, "list_vector_stores").await?;
        Ok(listing
            .data
            .into_iter()
            .map(|raw| VectorStoreInfo {
                vs_id: raw.id,
                name: raw.name,
                file_ids: Vec::new(),
                expires_at: raw.expires_at,
            })
            .collect())
    }

    async fn delete_vector_store(&self, vs_id: &str) -> Result<(), ProviderError> {
        let request = self.authed(
            self.transport
                .http()
                .delete(self.url(&format!("/vector_stores/{vs_id}"))),
        );
        self.transport.execute(request, "delete_vector_store").await?;
        Ok(())
    }

    async fn add_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
        attributes: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let request = self
            .authed(
                self.transport
                    .http()
                    .post(self.url(&format!("/vector_stores/{vs_id}/files"))),
            )
            .json(&json!({"file_id": file_id, "attributes": attributes}));
        self.transport
            .execute(request, "add_vector_store_file")
            .await?;
        Ok(())
    }

    async fn remove_vector_store_file(
        &self,
        vs_id: &str,
        file_id: &str,
    ) -> Result<(), ProviderError> {
        let request = self.authed(
            self.transport
                .http()
                .delete(self.url(&format!("/vector_stores/{vs_id}/files/{file_id}"))),
        );
        self.transport
            .execute(request, "remove_vector_store_file")
            .await?;
        Ok(())
    }

    async fn set_vector_store_expiration(
        &self,
        vs_id: &str,
        days: u32,
    ) -> Result<(), ProviderError> {
        let request = self
            .authed(
                self.transport
                    .http()
                    .post(self.url(&format!("/vector_stores/{vs_id}"))),
            )
            .json(&json!({"expires_after": {"anchor": "last_active_at", "days": days}}));
        self.transport
            .execute(request, "set_vector_store_expiration")
            .await?;
        Ok(())
    }

    async fn create_batch(&self, jsonl_file_id: &str) -> Result<String, ProviderError> {
        let request = self
            .authed(self.transport.http().post(self.url("/batches")))
            .json(&json!({
                "input_file_id": jsonl_file_id,
                "endpoint": "/v1/responses",
                "completion_window": "24h",
            }));
        let response = self.transport.execute(request, "create_batch").await?;
        let id: IdOnly = Self::decode(response, "create_batch").await?;
        Ok(id.id)
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchStatus, ProviderError> {
        let request = self.authed(
            self.transport
                .http()
                .get(self.url(&format!("/batches/{batch_id}"))),
        );
        let response = self.transport.execute(request, "get_batch").await?;
        let raw: RawBatch = Self::decode(response, "get_batch").await?;
        Ok(raw.into())
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<(), ProviderError> {
        let request = self.authed(
            self.transport
                .http()
                .post(self.url(&format!("/batches/{batch_id}/cancel"))),
        );
        self.transport.execute(request, "cancel_batch").await?;
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<BatchStatus>, ProviderError> {
        let request = self.authed(self.transport.http().get(self.url("/batches")));
        let response = self.transport.execute(request, "list_batches").await?;
        let listing: Listing<RawBatch> = Self::decode(response, "list_batches").await?;
        Ok(listing.data.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorcast_config::TransportConfig;
    use mirrorcast_utils::cancel::CancelFlag;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpProviderClient {
        let config = TransportConfig {
            request_timeout_secs: 5,
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            ..TransportConfig::default()
        };
        let transport = Transport::new(&config, CancelFlag::new()).unwrap();
        HttpProviderClient::new(transport, server.uri(), "test-key")
    }

    #[tokio::test]
    async fn test_create_response_flattens_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(header("Idempotency-Key", "RUN_X:A1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1",
                "model": "omni-medium",
                "status": "completed",
                "output": [
                    {"type": "reasoning", "content": []},
                    {"type": "message", "content": [
                        {"type": "output_text", "text": "{\"contract\":"},
                        {"type": "output_text", "text": "\"A1_PLAN\"}"}
                    ]}
                ],
                "usage": {"input_tokens": 10, "output_tokens": 5}
            })))
            .mount(&server)
            .await;

        let request = ResponsesRequest::new("omni-medium", "do the thing")
            .with_idempotency("RUN_X", "A1");
        let envelope = client(&server).create_response(request).await.unwrap();
        assert_eq!(envelope.id, "resp_1");
        assert_eq!(envelope.output_text, r#"{"contract":"A1_PLAN"}"#);
        assert_eq!(envelope.usage.unwrap().input_tokens, 10);
    }

    #[tokio::test]
    async fn test_create_response_sends_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/responses"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "resp_1", "model": "m", "output": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = ResponsesRequest::new("m", "i").with_idempotency("r", "s");
        client(&server).create_response(request).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_bytes_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/files"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "file_42"})),
            )
            .mount(&server)
            .await;

        let file_id = client(&server)
            .upload_bytes("manifest.json", b"{}".to_vec(), "assistants")
            .await
            .unwrap();
        assert_eq!(file_id, "file_42");
    }

    #[tokio::test]
    async fn test_batch_lifecycle_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/batches"))
            .and(body_partial_json(json!({"input_file_id": "file_9"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "batch_1", "status": "validating"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/batches/batch_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "batch_1", "status": "completed", "output_file_id": "file_out"
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let batch_id = client.create_batch("file_9").await.unwrap();
        assert_eq!(batch_id, "batch_1");

        let status = client.get_batch(&batch_id).await.unwrap();
        assert!(status.is_terminal());
        assert_eq!(status.output_file_id.as_deref(), Some("file_out"));
    }

    #[tokio::test]
    async fn test_vector_store_add_file_carries_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vector_stores/vs_1/files"))
            .and(body_partial_json(json!({
                "file_id": "file_1",
                "attributes": {"original_path": "/work/in/a.txt"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "vsf_1"})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .add_vector_store_file("vs_1", "file_1", json!({"original_path": "/work/in/a.txt"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_models_unwraps_data_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "omni-medium"}, {"id": "omni-small", "created": 1}]
            })))
            .mount(&server)
            .await;

        let models = client(&server).list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "omni-medium");
    }

    #[tokio::test]
    async fn test_file_listing_and_deletion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "file_1", "purpose": "assistants", "bytes": 12}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/files/file_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let files = client.list_files().await.unwrap();
        assert_eq!(files[0].file_id, "file_1");
        assert_eq!(files[0].bytes, 12);
        client.delete_file("file_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_vector_store_detach_and_expiration() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/vector_stores/vs_1/files/file_1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/vector_stores/vs_1"))
            .and(body_partial_json(json!({
                "expires_after": {"anchor": "last_active_at", "days": 7}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "vs_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client
            .remove_vector_store_file("vs_1", "file_1")
            .await
            .unwrap();
        client.set_vector_store_expiration("vs_1", 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_file_returns_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/file_1/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw\r\nbytes".to_vec()))
            .mount(&server)
            .await;

        let bytes = client(&server).download_file("file_1").await.unwrap();
        assert_eq!(bytes, b"raw\r\nbytes");
    }
}
