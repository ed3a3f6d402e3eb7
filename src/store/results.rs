//! Append-only result log and the cycle error channel.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Store, StoreError};
use crate::metrics::{MetricRecord, METRIC_COUNT};

/// Where completed measurements (and cycle failures) are written.
pub trait ResultSink: Send + Sync {
    /// Append one record. Called exactly once per completed job.
    fn append(&self, record: &MetricRecord) -> Result<()>;

    /// Best-effort operator-visible error row.
    fn record_error(&self, target: Option<&str>, message: &str) -> Result<()>;
}

/// A row from the `cycle_errors` table.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub occurred_at: DateTime<Utc>,
    pub target: Option<String>,
    pub message: String,
}

/// Result-log view over a [`Store`].
pub struct ResultLog<'a> {
    store: &'a Store,
}

impl<'a> ResultLog<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn append(&self, record: &MetricRecord) -> Result<(), StoreError> {
        let metrics = serde_json::to_string(&record.metrics).map_err(|e| StoreError::Corrupt {
            table: "results",
            detail: e.to_string(),
        })?;
        let db = self.store.conn()?;
        db.execute(
            "INSERT INTO results (target_key, completed_at, metrics, report_url, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.target,
                record.completed_at.to_rfc3339(),
                metrics,
                record.report_url,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn record_error(&self, target: Option<&str>, message: &str) -> Result<(), StoreError> {
        let db = self.store.conn()?;
        db.execute(
            "INSERT INTO cycle_errors (occurred_at, target_key, message) VALUES (?1, ?2, ?3)",
            params![Utc::now().to_rfc3339(), target, message],
        )?;
        Ok(())
    }

    /// Most recent records first. `target` narrows to one target.
    pub fn recent(&self, target: Option<&str>, limit: usize) -> Result<Vec<MetricRecord>, StoreError> {
        let db = self.store.conn()?;
        let mut stmt = db.prepare(
            "SELECT target_key, completed_at, metrics, report_url FROM results
             WHERE ?1 IS NULL OR target_key = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![target, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(target, completed_at, metrics, report_url)| {
                let corrupt = |detail: String| StoreError::Corrupt { table: "results", detail };
                let completed_at = DateTime::parse_from_rfc3339(&completed_at)
                    .map_err(|e| corrupt(e.to_string()))?
                    .with_timezone(&Utc);
                let metrics: [f64; METRIC_COUNT] =
                    serde_json::from_str(&metrics).map_err(|e| corrupt(e.to_string()))?;
                Ok::<_, StoreError>(MetricRecord {
                    target,
                    completed_at,
                    metrics,
                    report_url,
                })
            })
            .collect()
    }

    pub fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorEntry>, StoreError> {
        let db = self.store.conn()?;
        let mut stmt = db.prepare(
            "SELECT occurred_at, target_key, message FROM cycle_errors ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ErrorEntry {
                    occurred_at: row
                        .get::<_, String>(0)
                        .map(|s| {
                            DateTime::parse_from_rfc3339(&s)
                                .map(|dt| dt.with_timezone(&Utc))
                                .unwrap_or_default()
                        })?,
                    target: row.get(1)?,
                    message: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl ResultSink for Store {
    fn append(&self, record: &MetricRecord) -> Result<()> {
        self.results().append(record)?;
        tracing::info!(key = %record.target, report = %record.report_url, "Result recorded");
        Ok(())
    }

    fn record_error(&self, target: Option<&str>, message: &str) -> Result<()> {
        self.results().record_error(target, message)?;
        Ok(())
    }
}
