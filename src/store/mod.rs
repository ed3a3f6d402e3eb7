//! Durable state: job slots, scheduling state, and the result log,
//! backed by SQLite.
//!
//! Nothing is cached between activations: every call takes the
//! connection, runs its statement(s), and commits before returning, so a
//! process that did not create the database can pick up where the last
//! one left off.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub mod jobs;
pub mod results;
pub mod state;

pub use jobs::{Job, Jobs};
pub use results::{ResultLog, ResultSink};
pub use state::{CycleLease, SchedulerState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target '{0}' already has an outstanding job")]
    DuplicateKey(String),

    #[error("all {0} job slots are occupied")]
    Full(usize),

    #[error("job {0} must not be empty")]
    Blank(&'static str),

    #[error("store mutex poisoned")]
    Poisoned,

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// The SQLite-backed store shared by every component.
pub struct Store {
    db: Mutex<Connection>,
    capacity: usize,
}

impl Store {
    /// Open (or create) the store at the given path with `capacity` job slots.
    pub fn open(db_path: &Path, capacity: usize) -> Result<Self, StoreError> {
        let db = Connection::open(db_path)?;

        // WAL mode so `status` can read while a cycle writes
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.busy_timeout(std::time::Duration::from_secs(5))?;

        Self::init(db, capacity)
    }

    /// A private, throwaway store.
    #[cfg(test)]
    pub fn open_in_memory(capacity: usize) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, capacity)
    }

    fn init(db: Connection, capacity: usize) -> Result<Self, StoreError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS job_slots (
                slot INTEGER PRIMARY KEY,
                target_key TEXT NOT NULL DEFAULT '',
                handle TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS scheduler_state (
                owner TEXT PRIMARY KEY,
                activation_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activations (
                id TEXT PRIMARY KEY,
                interval_secs INTEGER NOT NULL,
                registered_at TEXT NOT NULL,
                next_due_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cycle_lease (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_key TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                metrics TEXT NOT NULL,
                report_url TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cycle_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                occurred_at TEXT NOT NULL,
                target_key TEXT,
                message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_target ON results(target_key, completed_at);
            CREATE INDEX IF NOT EXISTS idx_job_slots_key ON job_slots(target_key);
            ",
        )?;

        // Slots are pre-created so empty ones read back as ('', '')
        {
            let mut stmt = db.prepare("INSERT OR IGNORE INTO job_slots (slot) VALUES (?1)")?;
            for slot in 0..capacity {
                stmt.execute([slot as i64])?;
            }
        }

        Ok(Self {
            db: Mutex::new(db),
            capacity,
        })
    }

    /// Configured maximum number of outstanding jobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn jobs(&self) -> Jobs<'_> {
        Jobs::new(self)
    }

    pub fn scheduler_state(&self) -> SchedulerState<'_> {
        SchedulerState::new(self)
    }

    pub fn results(&self) -> ResultLog<'_> {
        ResultLog::new(self)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Milliseconds since the epoch, as stored in the lease and ledger tables.
pub(crate) fn epoch_ms(at: chrono::DateTime<chrono::Utc>) -> i64 {
    at.timestamp_millis()
}
