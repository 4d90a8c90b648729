//! Capability probing and caching
//!
//! Three booleans per model: chaining (`previous_response_id`),
//! temperature, and `file_search`. The cache is a JSON file with a 7-day
//! TTL, guarded by an advisory file lock for cross-process updates.
//!
//! Probing separates *not supported* from *transient failure*: only an
//! explicit parameter-rejected error flips a capability off, and only a
//! successful use flips it on. Timeouts, rate limits, and outages leave
//! the cached value untouched, so noise can never downgrade a model.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Duration, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use thiserror::Error;
use tracing::{debug, warn};

use mirrorcast_provider::{InputSegment, ProviderClient, ProviderError, ResponsesRequest, Tool};
use mirrorcast_utils::atomic_write::write_json_atomic;

/// Cache freshness horizon.
pub const CAPABILITY_TTL_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability cache I/O failure at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("capability cache is corrupt at {path}: {source}")]
    Corrupt {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// What one model can do, and when we last learned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub supports_previous_response: bool,
    pub supports_temperature: bool,
    pub supports_file_search: bool,
    pub probed_at: DateTime<Utc>,
}

impl CapabilityRecord {
    /// Optimistic default for a never-probed model.
    #[must_use]
    pub fn assume_all(probed_at: DateTime<Utc>) -> Self {
        Self {
            supports_previous_response: true,
            supports_temperature: true,
            supports_file_search: true,
            probed_at,
        }
    }

    /// Whether this record is still inside the TTL.
    #[must_use]
    pub fn is_fresh(&self, ttl_days: i64) -> bool {
        Utc::now() - self.probed_at < Duration::days(ttl_days)
    }
}

/// Disk-persisted capability cache.
pub struct CapabilityCache {
    path: Utf8PathBuf,
}

impl CapabilityCache {
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// Read the whole cache. A missing file is an empty cache.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or corrupt cache files.
    pub fn load_all(&self) -> Result<HashMap<String, CapabilityRecord>, CapabilityError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content =
            fs::read_to_string(self.path.as_std_path()).map_err(|source| CapabilityError::Io {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_str(&content).map_err(|source| CapabilityError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Fetch one model's record.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or corrupt cache files.
    pub fn get(&self, model: &str) -> Result<Option<CapabilityRecord>, CapabilityError> {
        Ok(self.load_all()?.get(model).copied())
    }

    /// Store one model's record under an advisory file lock, so probe
    /// updates from concurrent processes cannot interleave.
    ///
    /// # Errors
    ///
    /// Fails when the lock or the write cannot be taken.
    pub fn store(&self, model: &str, record: CapabilityRecord) -> Result<(), CapabilityError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|source| CapabilityError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let lock_path = self.path.with_extension("lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path.as_std_path())
            .map_err(|source| CapabilityError::Io {
                path: lock_path.clone(),
                source,
            })?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write().map_err(|source| CapabilityError::Io {
            path: lock_path,
            source,
        })?;

        let mut all = self.load_all()?;
        all.insert(model.to_string(), record);
        write_json_atomic(&self.path, &all).map_err(|e| CapabilityError::Io {
            path: self.path.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;
        Ok(())
    }
}

/// Resolve a model's capabilities: cached when fresh, probed otherwise.
/// `force` ignores the TTL and probes regardless.
///
/// # Errors
///
/// Propagates cache corruption and non-transient probe failures. A probe
/// run where every signal was transient resolves to the prior record (or
/// the optimistic default) without updating the cache.
pub async fn resolve(
    cache: &CapabilityCache,
    client: &dyn ProviderClient,
    model: &str,
    force: bool,
) -> Result<CapabilityRecord, CapabilityError> {
    let cached = cache.get(model)?;
    if !force
        && let Some(record) = cached
        && record.is_fresh(CAPABILITY_TTL_DAYS)
    {
        debug!(model, "capability cache hit");
        return Ok(record);
    }

    let probed = probe(client, model, cached).await?;
    match probed {
        ProbeResolution::Definitive(record) => {
            cache.store(model, record)?;
            Ok(record)
        }
        ProbeResolution::Unchanged(record) => {
            // Transient noise: keep (and do not re-stamp) the old record.
            warn!(model, "capability probe inconclusive; keeping prior record");
            Ok(record)
        }
    }
}

enum ProbeResolution {
    /// At least one signal was definitive; the record is re-stamped.
    Definitive(CapabilityRecord),
    /// Every signal was transient; nothing may be persisted.
    Unchanged(CapabilityRecord),
}

/// One probe outcome for one feature.
enum Signal {
    Supported,
    Unsupported,
    Transient,
}

fn classify(result: &Result<mirrorcast_provider::ResponseEnvelope, ProviderError>, needle: &str) -> Signal {
    match result {
        Ok(_) => Signal::Supported,
        Err(error) => {
            if let ProviderError::Api { status, message } = error
                && matches!(status, 400 | 422)
                && message.to_ascii_lowercase().contains(needle)
            {
                return Signal::Unsupported;
            }
            Signal::Transient
        }
    }
}

fn minimal_request(model: &str, marker: &str) -> ResponsesRequest {
    let mut request = ResponsesRequest::new(
        model,
        "Reply with the single word: ok. No other output.",
    );
    request.input.push(InputSegment::InputText {
        text: "ok".to_string(),
    });
    request.idempotency_key = format!("capability-probe:{model}:{marker}");
    request
}

async fn probe(
    client: &dyn ProviderClient,
    model: &str,
    cached: Option<CapabilityRecord>,
) -> Result<ProbeResolution, CapabilityError> {
    let prior = cached.unwrap_or_else(|| CapabilityRecord::assume_all(Utc::now()));

    // Base request: no optional features. Its id seeds the chaining probe.
    let base = client.create_response(minimal_request(model, "base")).await;
    let base_id = match &base {
        Ok(envelope) => Some(envelope.id.clone()),
        Err(error) if !error.is_retryable() => {
            // The model itself is unusable; surface that rather than
            // recording anything about features.
            return Err(error.clone().into());
        }
        Err(_) => None,
    };

    let mut any_definitive = false;
    let mut record = prior;

    // Temperature probe.
    let outcome = client
        .create_response(minimal_request(model, "temperature").with_temperature(0.0))
        .await;
    match classify(&outcome, "temperature") {
        Signal::Supported => {
            record.supports_temperature = true;
            any_definitive = true;
        }
        Signal::Unsupported => {
            record.supports_temperature = false;
            any_definitive = true;
        }
        Signal::Transient => {}
    }

    // Chaining probe, only when the base request produced a chain head.
    if let Some(base_id) = base_id {
        let mut request = minimal_request(model, "chaining");
        request.previous_response_id = Some(base_id);
        let outcome = client.create_response(request).await;
        match classify(&outcome, "previous_response") {
            Signal::Supported => {
                record.supports_previous_response = true;
                any_definitive = true;
            }
            Signal::Unsupported => {
                record.supports_previous_response = false;
                any_definitive = true;
            }
            Signal::Transient => {}
        }
    }

    // file_search probe: attach the tool with no stores; a provider that
    // knows the tool accepts or complains about the stores, one that does
    // not rejects the tool by name.
    let mut request = minimal_request(model, "file_search");
    request.tools.push(Tool::FileSearch {
        vector_store_ids: Vec::new(),
    });
    let outcome = client.create_response(request).await;
    match classify(&outcome, "file_search") {
        Signal::Supported => {
            record.supports_file_search = true;
            any_definitive = true;
        }
        Signal::Unsupported => {
            record.supports_file_search = false;
            any_definitive = true;
        }
        Signal::Transient => {}
    }

    if any_definitive {
        record.probed_at = Utc::now();
        Ok(ProbeResolution::Definitive(record))
    } else {
        Ok(ProbeResolution::Unchanged(record))
    }
}
