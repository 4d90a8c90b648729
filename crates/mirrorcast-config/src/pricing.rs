//! Pricing table
//!
//! Consumed, never produced: whoever refreshes the table (scraper, manual
//! edit) writes a TOML file with per-model rates and an `as_of` stamp. A
//! table older than the TTL still prices receipts, but every receipt it
//! touches is flagged `cost_estimated`.

use camino::Utf8Path;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use crate::ConfigError;

/// Per-model unit rates in account currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_token: f64,
    pub output_per_token: f64,
    /// Discount multiplier applied to batch-mode usage.
    #[serde(default)]
    pub batch_multiplier: Option<f64>,
    /// Flat per-call rate for the file_search tool.
    #[serde(default)]
    pub tool_file_search: Option<f64>,
    /// Vector-store storage rate per byte-day.
    #[serde(default)]
    pub storage_per_byte_day: Option<f64>,
}

/// The full table plus its freshness stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    pub as_of: DateTime<Utc>,
    #[serde(default)]
    pub models: HashMap<String, ModelRates>,
}

impl PricingTable {
    /// Load a table from TOML.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, unreadable, or malformed.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path.as_std_path()).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether the table is older than `ttl_days`.
    #[must_use]
    pub fn is_stale(&self, ttl_days: i64) -> bool {
        Utc::now() - self.as_of > Duration::days(ttl_days)
    }

    /// Price a request. `None` when the model has no rates; batch usage is
    /// discounted by the batch multiplier when one is present.
    #[must_use]
    pub fn price(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        batch: bool,
    ) -> Option<f64> {
        let rates = self.models.get(model)?;
        let mut cost = input_tokens as f64 * rates.input_per_token
            + output_tokens as f64 * rates.output_per_token;
        if batch && let Some(multiplier) = rates.batch_multiplier {
            cost *= multiplier;
        }
        Some(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn table(as_of: DateTime<Utc>) -> PricingTable {
        let mut models = HashMap::new();
        models.insert(
            "omni-medium".to_string(),
            ModelRates {
                input_per_token: 0.000_002,
                output_per_token: 0.000_008,
                batch_multiplier: Some(0.5),
                tool_file_search: Some(0.0025),
                storage_per_byte_day: None,
            },
        );
        PricingTable { as_of, models }
    }

    #[test]
    fn test_price_known_model() {
        let table = table(Utc::now());
        let cost = table.price("omni-medium", 1000, 500, false).unwrap();
        let expected = 1000.0 * 0.000_002 + 500.0 * 0.000_008;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn test_price_batch_applies_multiplier() {
        let table = table(Utc::now());
        let plain = table.price("omni-medium", 1000, 500, false).unwrap();
        let batched = table.price("omni-medium", 1000, 500, true).unwrap();
        assert!((batched - plain * 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_price_unknown_model_is_none() {
        let table = table(Utc::now());
        assert!(table.price("unknown", 1, 1, false).is_none());
    }

    #[test]
    fn test_staleness_threshold() {
        let fresh = table(Utc::now() - Duration::days(3));
        assert!(!fresh.is_stale(7));

        let stale = table(Utc::now() - Duration::days(8));
        assert!(stale.is_stale(7));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("pricing.toml")).unwrap();
        let toml_src = r#"
            as_of = "2026-07-20T00:00:00Z"

            [models.omni-medium]
            input_per_token = 0.000002
            output_per_token = 0.000008
            batch_multiplier = 0.5
        "#;
        std::fs::write(path.as_std_path(), toml_src).unwrap();

        let table = PricingTable::load(&path).unwrap();
        assert!(table.models.contains_key("omni-medium"));
        assert_eq!(
            table.models["omni-medium"].batch_multiplier,
            Some(0.5)
        );
    }
}
