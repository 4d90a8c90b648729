//! Configuration, pricing, and credentials
//!
//! Configuration is a TOML file discovered under the platform config
//! directory (overridable per invocation). Every knob has a serde default
//! so a missing file is a valid, fully-defaulted configuration. Pricing is
//! a separately-loaded table with a freshness timestamp; stale or absent
//! pricing flips `cost_estimated` on receipts rather than failing runs.

mod pricing;

pub use pricing::{ModelRates, PricingTable};

use camino::{Utf8Path, Utf8PathBuf};
use mirrorcast_pathsafe::WalkerPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found at {0}")]
    NotFound(Utf8PathBuf),
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration {path}: {source}")]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Provider endpoint and credential lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key, consulted when the OS
    /// credential store yields nothing.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    "https://api.provider.example/v1".to_string()
}

fn default_api_key_env() -> String {
    "MIRRORCAST_API_KEY".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Transport timeouts, retry policy, and circuit breaker tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive retryable failures that trip the breaker.
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,
    /// Window within which those failures must occur.
    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,
    /// How long the breaker stays open before a half-open probe.
    #[serde(default = "default_breaker_open_secs")]
    pub breaker_open_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_breaker_failures() -> u32 {
    5
}
fn default_breaker_window_secs() -> u64 {
    30
}
fn default_breaker_open_secs() -> u64 {
    30
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            breaker_failures: default_breaker_failures(),
            breaker_window_secs: default_breaker_window_secs(),
            breaker_open_secs: default_breaker_open_secs(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub walker: WalkerPolicy,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Bounded worker count for independent uploads within a run.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Pricing freshness TTL in days; older tables flag estimates.
    #[serde(default = "default_pricing_ttl_days")]
    pub pricing_ttl_days: i64,
}

fn default_upload_concurrency() -> usize {
    4
}
fn default_pricing_ttl_days() -> i64 {
    7
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            transport: TransportConfig::default(),
            walker: WalkerPolicy::default(),
            paths: PathsConfig::default(),
            upload_concurrency: default_upload_concurrency(),
            pricing_ttl_days: default_pricing_ttl_days(),
        }
    }
}

/// Locations of the durable stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Receipt ledger database; defaults to `receipts.db` beside the
    /// executable.
    #[serde(default)]
    pub ledger: Option<Utf8PathBuf>,
    /// Capability cache JSON; defaults under the platform data directory.
    #[serde(default)]
    pub capability_cache: Option<Utf8PathBuf>,
    /// Pricing table TOML.
    #[serde(default)]
    pub pricing: Option<Utf8PathBuf>,
}

impl Config {
    /// The default configuration file location:
    /// `<config_dir>/mirrorcast/config.toml`.
    #[must_use]
    pub fn default_path() -> Utf8PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        Utf8PathBuf::from_path_buf(base)
            .unwrap_or_else(|_| Utf8PathBuf::from("."))
            .join("mirrorcast")
            .join("config.toml")
    }

    /// Load configuration from an explicit path.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, unreadable, fails to parse, or
    /// carries invalid values.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path.as_std_path()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Discover configuration: explicit path if given, else the default
    /// location, else built-in defaults when no file exists.
    ///
    /// # Errors
    ///
    /// An explicit path that is missing or invalid is an error; a missing
    /// default file is not.
    pub fn discover(explicit: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upload_concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "transport.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.transport.backoff_base_ms > self.transport.backoff_cap_ms {
            return Err(ConfigError::InvalidValue {
                key: "transport.backoff_base_ms".to_string(),
                reason: "must not exceed backoff_cap_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Effective ledger path.
    #[must_use]
    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.paths
            .ledger
            .clone()
            .unwrap_or_else(|| beside_executable("receipts.db"))
    }

    /// Effective capability cache path.
    #[must_use]
    pub fn capability_cache_path(&self) -> Utf8PathBuf {
        self.paths.capability_cache.clone().unwrap_or_else(|| {
            let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
            Utf8PathBuf::from_path_buf(base)
                .unwrap_or_else(|_| Utf8PathBuf::from("."))
                .join("mirrorcast")
                .join("capabilities.json")
        })
    }

    /// Minimal configuration for tests: defaults only, no discovery.
    #[must_use]
    pub fn minimal_for_testing() -> Self {
        Self::default()
    }
}

fn beside_executable(file_name: &str) -> Utf8PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(std::path::Path::to_path_buf))
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
        .join(file_name)
}

/// Capability for obtaining secrets. The OS credential vault and plain
/// environment variables are both providers; the core never cares which.
pub trait CredentialProvider: Send + Sync {
    /// Fetch a secret by name, if present.
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from process environment variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }
}

/// Fixed in-memory secrets. Test seam and GUI injection point.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    entries: std::collections::HashMap<String, String>,
}

impl StaticCredentialProvider {
    #[must_use]
    pub fn with(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut entries = std::collections::HashMap::new();
        entries.insert(name.into(), value.into());
        Self { entries }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get(&self, name: &str) -> Option<String> {
        self.entries.get(name).cloned()
    }
}
