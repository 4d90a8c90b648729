//! Receipt ledger
//!
//! One table, keyed by `(run_id, step_key)`. Deduplication is the primary
//! key, not a lookup: `record` uses `INSERT OR IGNORE`, so replays and
//! resumed runs cannot double-book cost. WAL journaling keeps concurrent
//! readers unblocked while the single writer appends.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ledger timestamp '{0}' is not RFC 3339")]
    BadTimestamp(String),
}

/// One cost-accounting record per completed request that returned usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub run_id: String,
    pub step_key: String,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub model: String,
    pub mode: String,
    #[serde(default)]
    pub project: Option<String>,
    /// Digest of the prompt, for full-text lookup without storing prompts.
    #[serde(default)]
    pub prompt_digest: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub tool_usage: Option<serde_json::Value>,
    /// Storage cost basis in byte-days, when the Provider reports it.
    #[serde(default)]
    pub storage_bytes_time: Option<f64>,
    /// Computed cost in account currency; absent when no pricing applied.
    #[serde(default)]
    pub cost: Option<f64>,
    /// Set when the pricing table was stale or absent at recording time.
    pub cost_estimated: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Filters for [`Ledger::query`]. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct ReceiptQuery {
    pub run_id: Option<String>,
    pub response_id: Option<String>,
    pub batch_id: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub project: Option<String>,
    /// Substring match over the stored prompt digest.
    pub digest_contains: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Handle to the embedded receipts database.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be opened or migrated.
    pub fn open(path: &Utf8Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path.as_std_path())?;
        Self::init(conn)
    }

    /// Open an in-memory ledger. Test seam; same schema as on disk.
    ///
    /// # Errors
    ///
    /// Fails if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS receipts (
                run_id             TEXT NOT NULL,
                step_key           TEXT NOT NULL,
                response_id        TEXT,
                batch_id           TEXT,
                model              TEXT NOT NULL,
                mode               TEXT NOT NULL,
                project            TEXT,
                prompt_digest      TEXT,
                input_tokens       INTEGER NOT NULL,
                output_tokens      INTEGER NOT NULL,
                tool_usage         TEXT,
                storage_bytes_time REAL,
                cost               REAL,
                cost_estimated     INTEGER NOT NULL,
                recorded_at        TEXT NOT NULL,
                PRIMARY KEY (run_id, step_key)
            );
            CREATE INDEX IF NOT EXISTS idx_receipts_run ON receipts(run_id);
            CREATE INDEX IF NOT EXISTS idx_receipts_response ON receipts(response_id);
            CREATE INDEX IF NOT EXISTS idx_receipts_batch ON receipts(batch_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a receipt. Idempotent: a duplicate `(run_id, step_key)` is
    /// ignored and reported as `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Fails only on real database errors, never on duplicates.
    pub fn record(&self, receipt: &Receipt) -> Result<bool, LedgerError> {
        let tool_usage = receipt
            .tool_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO receipts (
                run_id, step_key, response_id, batch_id, model, mode, project,
                prompt_digest, input_tokens, output_tokens, tool_usage,
                storage_bytes_time, cost, cost_estimated, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                receipt.run_id,
                receipt.step_key,
                receipt.response_id,
                receipt.batch_id,
                receipt.model,
                receipt.mode,
                receipt.project,
                receipt.prompt_digest,
                receipt.input_tokens as i64,
                receipt.output_tokens as i64,
                tool_usage,
                receipt.storage_bytes_time,
                receipt.cost,
                receipt.cost_estimated as i32,
                receipt.recorded_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            debug!(
                run_id = %receipt.run_id,
                step_key = %receipt.step_key,
                "duplicate receipt ignored"
            );
        }
        Ok(inserted == 1)
    }

    /// Fetch one receipt by its dedup key.
    ///
    /// # Errors
    ///
    /// Fails on database errors; a missing row is `Ok(None)`.
    pub fn get(&self, run_id: &str, step_key: &str) -> Result<Option<Receipt>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM receipts WHERE run_id = ?1 AND step_key = ?2"),
            params![run_id, step_key],
            row_to_receipt,
        )
        .optional()?
        .transpose()
    }

    /// Query receipts by filters, newest first.
    ///
    /// # Errors
    ///
    /// Fails on database errors or unparseable stored rows.
    pub fn query(&self, filters: &ReceiptQuery) -> Result<Vec<Receipt>, LedgerError> {
        let mut sql = format!("SELECT {COLUMNS} FROM receipts WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let mut push = |clause: &str, value: Box<dyn rusqlite::ToSql>| {
            sql.push_str(clause);
            args.push(value);
        };

        if let Some(run_id) = &filters.run_id {
            push(" AND run_id = ?", Box::new(run_id.clone()));
        }
        if let Some(response_id) = &filters.response_id {
            push(" AND response_id = ?", Box::new(response_id.clone()));
        }
        if let Some(batch_id) = &filters.batch_id {
            push(" AND batch_id = ?", Box::new(batch_id.clone()));
        }
        if let Some(model) = &filters.model {
            push(" AND model = ?", Box::new(model.clone()));
        }
        if let Some(mode) = &filters.mode {
            push(" AND mode = ?", Box::new(mode.clone()));
        }
        if let Some(project) = &filters.project {
            push(" AND project = ?", Box::new(project.clone()));
        }
        if let Some(fragment) = &filters.digest_contains {
            push(
                " AND prompt_digest LIKE ?",
                Box::new(format!("%{fragment}%")),
            );
        }
        if let Some(since) = &filters.since {
            push(" AND recorded_at >= ?", Box::new(since.to_rfc3339()));
        }
        if let Some(until) = &filters.until {
            push(" AND recorded_at <= ?", Box::new(until.to_rfc3339()));
        }
        sql.push_str(" ORDER BY recorded_at DESC, run_id, step_key");

        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(AsRef::as_ref).collect();
        let rows = stmt.query_map(params_ref.as_slice(), row_to_receipt)?;

        let mut receipts = Vec::new();
        for row in rows {
            receipts.push(row??);
        }
        Ok(receipts)
    }
}

const COLUMNS: &str = "run_id, step_key, response_id, batch_id, model, mode, project, \
     prompt_digest, input_tokens, output_tokens, tool_usage, storage_bytes_time, \
     cost, cost_estimated, recorded_at";

fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Receipt, LedgerError>> {
    let tool_usage_raw: Option<String> = row.get(10)?;
    let recorded_at_raw: String = row.get(14)?;

    Ok((|| {
        let tool_usage = tool_usage_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_raw)
            .map_err(|_| LedgerError::BadTimestamp(recorded_at_raw.clone()))?
            .with_timezone(&Utc);
        Ok(Receipt {
            run_id: row.get(0)?,
            step_key: row.get(1)?,
            response_id: row.get(2)?,
            batch_id: row.get(3)?,
            model: row.get(4)?,
            mode: row.get(5)?,
            project: row.get(6)?,
            prompt_digest: row.get(7)?,
            input_tokens: row.get::<_, i64>(8)? as u64,
            output_tokens: row.get::<_, i64>(9)? as u64,
            tool_usage,
            storage_bytes_time: row.get(11)?,
            cost: row.get(12)?,
            cost_estimated: row.get::<_, i32>(13)? != 0,
            recorded_at,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(run_id: &str, step_key: &str) -> Receipt {
        Receipt {
            run_id: run_id.to_string(),
            step_key: step_key.to_string(),
            response_id: Some(format!("resp_{step_key}")),
            batch_id: None,
            model: "omni-medium".to_string(),
            mode: "GENERATE".to_string(),
            project: Some("demo".to_string()),
            prompt_digest: Some("abc123def".to_string()),
            input_tokens: 100,
            output_tokens: 50,
            tool_usage: Some(serde_json::json!({"file_search": 1})),
            storage_bytes_time: None,
            cost: Some(0.0042),
            cost_estimated: false,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_and_get_round_trip() {
        let ledger = Ledger::open_in_memory().unwrap();
        let original = receipt("RUN_1", "A1");
        assert!(ledger.record(&original).unwrap());

        let fetched = ledger.get("RUN_1", "A1").unwrap().unwrap();
        assert_eq!(fetched.response_id, original.response_id);
        assert_eq!(fetched.input_tokens, 100);
        assert_eq!(fetched.tool_usage, original.tool_usage);
        assert!(!fetched.cost_estimated);
    }

    #[test]
    fn test_duplicate_key_is_ignored_not_raised() {
        let ledger = Ledger::open_in_memory().unwrap();
        let first = receipt("RUN_1", "A1");
        let mut second = receipt("RUN_1", "A1");
        second.input_tokens = 999;

        assert!(ledger.record(&first).unwrap());
        assert!(!ledger.record(&second).unwrap());

        // The original row survives.
        let fetched = ledger.get("RUN_1", "A1").unwrap().unwrap();
        assert_eq!(fetched.input_tokens, 100);
    }

    #[test]
    fn test_same_step_key_different_runs_both_recorded() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(ledger.record(&receipt("RUN_1", "A1")).unwrap());
        assert!(ledger.record(&receipt("RUN_2", "A1")).unwrap());
    }

    #[test]
    fn test_query_by_run_model_and_mode() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record(&receipt("RUN_1", "A1")).unwrap();
        ledger.record(&receipt("RUN_1", "A2")).unwrap();
        let mut other = receipt("RUN_2", "A1");
        other.model = "omni-small".to_string();
        ledger.record(&other).unwrap();

        let by_run = ledger
            .query(&ReceiptQuery {
                run_id: Some("RUN_1".to_string()),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert_eq!(by_run.len(), 2);

        let by_model = ledger
            .query(&ReceiptQuery {
                model: Some("omni-small".to_string()),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].run_id, "RUN_2");
    }

    #[test]
    fn test_query_by_response_and_batch_id() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record(&receipt("RUN_1", "A1")).unwrap();
        let mut batch = receipt("RUN_3", "BATCH");
        batch.response_id = None;
        batch.batch_id = Some("batch_9".to_string());
        ledger.record(&batch).unwrap();

        let by_response = ledger
            .query(&ReceiptQuery {
                response_id: Some("resp_A1".to_string()),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert_eq!(by_response.len(), 1);

        let by_batch = ledger
            .query(&ReceiptQuery {
                batch_id: Some("batch_9".to_string()),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert_eq!(by_batch.len(), 1);
        assert_eq!(by_batch[0].run_id, "RUN_3");
    }

    #[test]
    fn test_query_by_digest_fragment_and_date_range() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record(&receipt("RUN_1", "A1")).unwrap();

        let hit = ledger
            .query(&ReceiptQuery {
                digest_contains: Some("123".to_string()),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = ledger
            .query(&ReceiptQuery {
                digest_contains: Some("zzz".to_string()),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert!(miss.is_empty());

        let future = ledger
            .query(&ReceiptQuery {
                since: Some(Utc::now() + chrono::Duration::hours(1)),
                ..ReceiptQuery::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_cost_estimated_round_trips() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut estimated = receipt("RUN_1", "A1");
        estimated.cost = None;
        estimated.cost_estimated = true;
        ledger.record(&estimated).unwrap();

        let fetched = ledger.get("RUN_1", "A1").unwrap().unwrap();
        assert!(fetched.cost_estimated);
        assert!(fetched.cost.is_none());
    }

    #[test]
    fn test_on_disk_ledger_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("receipts.db")).unwrap();

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.record(&receipt("RUN_1", "A1")).unwrap();
        }
        let reopened = Ledger::open(&path).unwrap();
        assert!(reopened.get("RUN_1", "A1").unwrap().is_some());
    }
}
