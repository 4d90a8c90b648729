//! Mirror uploader
//!
//! Walks the input tree, partitions files into uploadable / policy-skipped
//! / secret-skipped, uploads eligible files with bounded concurrency,
//! writes the manifest, uploads the manifest itself as a redundant
//! channel, and attaches everything to a vector store when the model
//! supports `file_search`. Single-file upload failures mark the entry and
//! continue; they never abort the mirror.

use camino::Utf8Path;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use mirrorcast_pathsafe::{WalkedFile, WalkerError, WalkerPolicy, walk};
use mirrorcast_provider::{ProviderClient, ProviderError};
use mirrorcast_redaction::{FileClassification, classify_file};
use mirrorcast_utils::ids::timestamp_digits;
use mirrorcast_utils::types::UploadedFile;

/// Bytes of each file inspected for secret shapes before upload.
const CLASSIFY_HEAD_BYTES: usize = 8192;

/// Upload purpose tag for mirrored files.
const UPLOAD_PURPOSE: &str = "assistants";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Walk(#[from] WalkerError),
    #[error("mirroring cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// One file seen by the mirror, whether or not it was uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub absolute_path: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    pub uploaded: bool,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    /// Key names found in secret-skipped files; never values.
    #[serde(default)]
    pub secret_keys: Vec<String>,
}

/// Machine-readable inventory of one run's mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Number of entries actually uploaded.
    #[must_use]
    pub fn uploaded_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.uploaded).count()
    }

    /// Serialize for logging or upload.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Everything the cascade needs after mirroring.
#[derive(Debug)]
pub struct MirrorOutcome {
    pub manifest: Manifest,
    /// Provider id of the uploaded manifest file, when that upload worked.
    pub manifest_file_id: Option<String>,
    /// Vector store id, when `file_search` was available and creation
    /// succeeded.
    pub vector_store_id: Option<String>,
    /// Relative path → registration, for the run state registry.
    pub uploaded: BTreeMap<String, UploadedFile>,
}

impl MirrorOutcome {
    /// Every provider file id the cascade must reference in each request:
    /// the mirrored files plus the manifest.
    #[must_use]
    pub fn all_file_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .uploaded
            .values()
            .map(|file| file.file_id.clone())
            .collect();
        if let Some(manifest_id) = &self.manifest_file_id {
            ids.push(manifest_id.clone());
        }
        ids
    }
}

/// Parameters for one mirror pass.
pub struct MirrorRequest<'a> {
    pub run_id: &'a str,
    pub project: Option<&'a str>,
    pub input_root: &'a Utf8Path,
    pub policy: &'a WalkerPolicy,
    pub supports_file_search: bool,
    pub concurrency: usize,
    pub cancel: mirrorcast_utils::cancel::CancelFlag,
}

/// Mirror an input tree into the Provider.
///
/// # Errors
///
/// Fails on walker errors and cancellation. Individual upload failures do
/// not fail the mirror; vector-store failures degrade to no store.
pub async fn mirror(
    client: Arc<dyn ProviderClient>,
    request: MirrorRequest<'_>,
) -> Result<MirrorOutcome, MirrorError> {
    let walked = walk(request.input_root, request.policy)?;
    let mut entries: Vec<ManifestEntry> = Vec::with_capacity(walked.len());
    let mut upload_indices = Vec::new();

    for file in &walked {
        let mut entry = ManifestEntry {
            relative_path: file.rel_path.clone(),
            absolute_path: file.abs_path.to_string(),
            size: file.size,
            sha256: file.sha256.clone(),
            uploaded: false,
            file_id: None,
            skip_reason: file.skip.as_ref().map(mirrorcast_pathsafe::WalkSkip::reason),
            secret_keys: Vec::new(),
        };

        if entry.skip_reason.is_none() {
            match classify_head(file) {
                FileClassification::Safe => upload_indices.push(entries.len()),
                FileClassification::Suspicious { reason, key_names } => {
                    debug!(path = %file.rel_path, reason, "skipping secret-like file");
                    entry.skip_reason = Some(format!("secret:{reason}"));
                    entry.secret_keys = key_names;
                }
            }
        }
        entries.push(entry);
    }

    // Bounded-concurrency upload of the eligible partition.
    let semaphore = Arc::new(Semaphore::new(request.concurrency.max(1)));
    let mut joins = JoinSet::new();
    for index in upload_indices {
        if request.cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let client = Arc::clone(&client);
        let abs_path = entries[index].absolute_path.clone();
        joins.spawn(async move {
            let _permit = permit;
            let result = client
                .upload_file(Utf8Path::new(&abs_path), UPLOAD_PURPOSE)
                .await;
            (index, result)
        });
    }

    while let Some(joined) = joins.join_next().await {
        let Ok((index, result)) = joined else {
            continue;
        };
        match result {
            Ok(file_id) => {
                entries[index].uploaded = true;
                entries[index].file_id = Some(file_id);
            }
            Err(ProviderError::Cancelled) => return Err(MirrorError::Cancelled),
            Err(error) => {
                warn!(
                    path = %entries[index].relative_path,
                    error = %error,
                    "upload failed; continuing without this file"
                );
                entries[index].skip_reason = Some("upload_failed".to_string());
            }
        }
    }

    if request.cancel.is_cancelled() {
        return Err(MirrorError::Cancelled);
    }

    let manifest = Manifest {
        run_id: request.run_id.to_string(),
        created_at: Utc::now(),
        entries,
    };

    // The manifest rides the same channel as the files it describes.
    let manifest_bytes = serde_json::to_vec_pretty(&manifest.to_value()).unwrap_or_default();
    let manifest_file_id = match client
        .upload_bytes("manifest.json", manifest_bytes, UPLOAD_PURPOSE)
        .await
    {
        Ok(file_id) => Some(file_id),
        Err(ProviderError::Cancelled) => return Err(MirrorError::Cancelled),
        Err(error) => {
            warn!(error = %error, "manifest upload failed; continuing without it");
            None
        }
    };

    let mut uploaded = BTreeMap::new();
    for entry in manifest.entries.iter().filter(|entry| entry.uploaded) {
        uploaded.insert(
            entry.relative_path.clone(),
            UploadedFile {
                file_id: entry.file_id.clone().unwrap_or_default(),
                sha256: entry.sha256.clone().unwrap_or_default(),
                size: entry.size,
            },
        );
    }

    let vector_store_id = if request.supports_file_search {
        build_vector_store(&client, &request, &manifest, manifest_file_id.as_deref()).await?
    } else {
        None
    };

    Ok(MirrorOutcome {
        manifest,
        manifest_file_id,
        vector_store_id,
        uploaded,
    })
}

async fn build_vector_store(
    client: &Arc<dyn ProviderClient>,
    request: &MirrorRequest<'_>,
    manifest: &Manifest,
    manifest_file_id: Option<&str>,
) -> Result<Option<String>, MirrorError> {
    let name = format!(
        "{}{}",
        request.project.unwrap_or("run"),
        timestamp_digits(Local::now())
    );
    let vs_id = match client.create_vector_store(&name).await {
        Ok(id) => id,
        Err(ProviderError::Cancelled) => return Err(MirrorError::Cancelled),
        Err(error) => {
            warn!(error = %error, "vector store creation failed; continuing without one");
            return Ok(None);
        }
    };

    for entry in manifest.entries.iter().filter(|entry| entry.uploaded) {
        if request.cancel.is_cancelled() {
            return Err(MirrorError::Cancelled);
        }
        let Some(file_id) = &entry.file_id else {
            continue;
        };
        let attributes = serde_json::json!({ "original_path": entry.absolute_path });
        if let Err(error) = client
            .add_vector_store_file(&vs_id, file_id, attributes)
            .await
        {
            if matches!(error, ProviderError::Cancelled) {
                return Err(MirrorError::Cancelled);
            }
            warn!(file_id, error = %error, "vector store attach failed");
        }
    }
    if let Some(manifest_id) = manifest_file_id {
        let attributes = serde_json::json!({ "original_path": "manifest.json" });
        if let Err(error) = client
            .add_vector_store_file(&vs_id, manifest_id, attributes)
            .await
        {
            if matches!(error, ProviderError::Cancelled) {
                return Err(MirrorError::Cancelled);
            }
            warn!(error = %error, "manifest vector store attach failed");
        }
    }

    Ok(Some(vs_id))
}

fn classify_head(file: &WalkedFile) -> FileClassification {
    let file_name = file
        .rel_path
        .rsplit('/')
        .next()
        .unwrap_or(file.rel_path.as_str());
    let mut head = vec![0_u8; CLASSIFY_HEAD_BYTES];
    let read = std::fs::File::open(file.abs_path.as_std_path())
        .and_then(|mut handle| handle.read(&mut head));
    match read {
        Ok(n) => {
            head.truncate(n);
            classify_file(file_name, &head)
        }
        // Unreadable now, unreadable at upload; let the uploader report.
        Err(_) => FileClassification::Safe,
    }
}

/// Render the instruction-embedded listing of attached files. Every
/// cascade request carries this text AND the same files as input parts;
/// the redundancy is deliberate.
#[must_use]
pub fn instruction_file_listing(outcome: &MirrorOutcome) -> String {
    let mut lines = vec![
        "Attached input files (also provided as input parts):".to_string(),
    ];
    for (rel_path, file) in &outcome.uploaded {
        lines.push(format!("- {} => {}", rel_path, file.file_id));
    }
    if let Some(manifest_id) = &outcome.manifest_file_id {
        lines.push(format!("- manifest.json => {manifest_id}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mirrorcast_provider::{
        BatchStatus, ModelInfo, ProviderFile, ResponseEnvelope, ResponsesRequest, VectorStoreInfo,
    };
    use mirrorcast_utils::cancel::CancelFlag;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct UploadDouble {
        counter: AtomicU64,
        fail_names: Vec<String>,
        vector_store: bool,
        attached: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProviderClient for UploadDouble {
        async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(Vec::new())
        }
        async fn create_response(
            &self,
            _request: ResponsesRequest,
        ) -> Result<ResponseEnvelope, ProviderError> {
            unimplemented!("not used by mirror")
        }
        async fn upload_file(
            &self,
            path: &Utf8Path,
            _purpose: &str,
        ) -> Result<String, ProviderError> {
            let name = path.file_name().unwrap_or_default().to_string();
            if self.fail_names.contains(&name) {
                return Err(ProviderError::Api {
                    status: 500,
                    message: "upload exploded".to_string(),
                });
            }
            Ok(format!("file_{}", self.counter.fetch_add(1, Ordering::SeqCst)))
        }
        async fn upload_bytes(
            &self,
            _file_name: &str,
            _bytes: Vec<u8>,
            _purpose: &str,
        ) -> Result<String, ProviderError> {
            Ok("file_manifest".to_string())
        }
        async fn list_files(&self) -> Result<Vec<ProviderFile>, ProviderError> {
            Ok(Vec::new())
        }
        async fn delete_file(&self, _file_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn download_file(&self, _file_id: &str) -> Result<Vec<u8>, ProviderError> {
            Ok(Vec::new())
        }
        async fn create_vector_store(&self, name: &str) -> Result<String, ProviderError> {
            if self.vector_store {
                assert!(name.len() > 12, "store name must carry time digits");
                Ok("vs_1".to_string())
            } else {
                panic!("vector store must not be created without file_search");
            }
        }
        async fn list_vector_stores(&self) -> Result<Vec<VectorStoreInfo>, ProviderError> {
            Ok(Vec::new())
        }
        async fn delete_vector_store(&self, _vs_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn add_vector_store_file(
            &self,
            _vs_id: &str,
            file_id: &str,
            attributes: serde_json::Value,
        ) -> Result<(), ProviderError> {
            assert!(attributes.get("original_path").is_some());
            self.attached.lock().unwrap().push(file_id.to_string());
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
        async fn create_batch(&self, _jsonl_file_id: &str) -> Result<String, ProviderError> {
            unimplemented!("not used by mirror")
        }
        async fn get_batch(&self, _batch_id: &str) -> Result<BatchStatus, ProviderError> {
            unimplemented!("not used by mirror")
        }
        async fn cancel_batch(&self, _batch_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn list_batches(&self) -> Result<Vec<BatchStatus>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn seed_tree(dir: &TempDir) -> camino::Utf8PathBuf {
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("a.txt").as_std_path(), "x").unwrap();
        std::fs::write(root.join("b.py").as_std_path(), "y").unwrap();
        std::fs::write(root.join(".env").as_std_path(), "API_KEY=supersecret\n").unwrap();
        root
    }

    fn request<'a>(
        run_id: &'a str,
        root: &'a Utf8Path,
        policy: &'a WalkerPolicy,
        file_search: bool,
    ) -> MirrorRequest<'a> {
        MirrorRequest {
            run_id,
            project: Some("demo"),
            input_root: root,
            policy,
            supports_file_search: file_search,
            concurrency: 4,
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test]
    async fn test_mirror_uploads_and_skips_secrets() {
        let dir = TempDir::new().unwrap();
        let root = seed_tree(&dir);
        let policy = WalkerPolicy::default();
        let client = Arc::new(UploadDouble::default());

        let outcome = mirror(
            client,
            request("RUN_1", &root, &policy, false),
        )
        .await
        .unwrap();

        assert_eq!(outcome.manifest.entries.len(), 3);
        assert_eq!(outcome.manifest.uploaded_count(), 2);
        assert_eq!(outcome.uploaded.len(), 2);
        assert!(outcome.uploaded.contains_key("a.txt"));
        assert!(outcome.uploaded.contains_key("b.py"));

        let env_entry = outcome
            .manifest
            .entries
            .iter()
            .find(|entry| entry.relative_path == ".env")
            .unwrap();
        assert!(!env_entry.uploaded);
        assert_eq!(env_entry.skip_reason.as_deref(), Some("secret:env_file"));
        assert_eq!(env_entry.secret_keys, vec!["API_KEY"]);

        // No file_search: no vector store, manifest still uploaded.
        assert!(outcome.vector_store_id.is_none());
        assert_eq!(outcome.manifest_file_id.as_deref(), Some("file_manifest"));
    }

    #[tokio::test]
    async fn test_single_upload_failure_does_not_abort() {
        let dir = TempDir::new().unwrap();
        let root = seed_tree(&dir);
        let policy = WalkerPolicy::default();
        let client = Arc::new(UploadDouble {
            fail_names: vec!["a.txt".to_string()],
            ..UploadDouble::default()
        });

        let outcome = mirror(client, request("RUN_1", &root, &policy, false))
            .await
            .unwrap();

        let failed = outcome
            .manifest
            .entries
            .iter()
            .find(|entry| entry.relative_path == "a.txt")
            .unwrap();
        assert!(!failed.uploaded);
        assert_eq!(failed.skip_reason.as_deref(), Some("upload_failed"));

        // The other file still made it.
        assert!(outcome.uploaded.contains_key("b.py"));
    }

    #[tokio::test]
    async fn test_vector_store_attaches_files_and_manifest() {
        let dir = TempDir::new().unwrap();
        let root = seed_tree(&dir);
        let policy = WalkerPolicy::default();
        let client = Arc::new(UploadDouble {
            vector_store: true,
            ..UploadDouble::default()
        });
        let attached_view = Arc::clone(&client);

        let outcome = mirror(client, request("RUN_1", &root, &policy, true))
            .await
            .unwrap();

        assert_eq!(outcome.vector_store_id.as_deref(), Some("vs_1"));
        let attached = attached_view.attached.lock().unwrap().clone();
        // Two files plus the manifest.
        assert_eq!(attached.len(), 3);
        assert!(attached.contains(&"file_manifest".to_string()));
    }

    #[tokio::test]
    async fn test_instruction_listing_enumerates_every_id() {
        let dir = TempDir::new().unwrap();
        let root = seed_tree(&dir);
        let policy = WalkerPolicy::default();
        let client = Arc::new(UploadDouble::default());

        let outcome = mirror(client, request("RUN_1", &root, &policy, false))
            .await
            .unwrap();

        let listing = instruction_file_listing(&outcome);
        for file in outcome.uploaded.values() {
            assert!(listing.contains(&file.file_id));
        }
        assert!(listing.contains("manifest.json => file_manifest"));
        assert_eq!(outcome.all_file_ids().len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_mirror() {
        let dir = TempDir::new().unwrap();
        let root = seed_tree(&dir);
        let policy = WalkerPolicy::default();
        let client = Arc::new(UploadDouble::default());

        let cancel = CancelFlag::new();
        cancel.cancel();
        let request = MirrorRequest {
            cancel,
            ..request("RUN_1", &root, &policy, false)
        };

        let error = mirror(client, request).await.unwrap_err();
        assert!(matches!(error, MirrorError::Cancelled));
    }
}
