//! Outstanding-job table.
//!
//! A fixed number of ordered slots, each holding a `(target_key, handle)`
//! pair; a free slot holds two empty strings. A job is never edited in
//! place: replacing one means `remove_by_key` followed by `put`.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Store, StoreError};

/// One outstanding asynchronous test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Logical target under test (unique among outstanding jobs).
    pub key: String,
    /// Polling reference handed back by the testing service.
    pub handle: String,
}

impl Job {
    pub fn new(key: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            handle: handle.into(),
        }
    }
}

/// Job-table view over a [`Store`].
pub struct Jobs<'a> {
    store: &'a Store,
}

impl<'a> Jobs<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Track a new job in the first free slot.
    pub fn put(&self, job: &Job) -> Result<(), StoreError> {
        if job.key.is_empty() {
            return Err(StoreError::Blank("key"));
        }
        if job.handle.is_empty() {
            return Err(StoreError::Blank("handle"));
        }

        let mut db = self.store.conn()?;
        let tx = db.transaction()?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT slot FROM job_slots WHERE target_key = ?1",
                params![job.key],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::DuplicateKey(job.key.clone()));
        }

        // Occupied slots beyond a since-lowered capacity still count.
        let occupied: i64 = tx.query_row(
            "SELECT COUNT(*) FROM job_slots WHERE target_key != ''",
            [],
            |row| row.get(0),
        )?;
        if occupied as usize >= self.store.capacity() {
            return Err(StoreError::Full(self.store.capacity()));
        }

        let free: Option<i64> = tx
            .query_row(
                "SELECT slot FROM job_slots WHERE target_key = '' ORDER BY slot LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let slot = free.ok_or(StoreError::Full(self.store.capacity()))?;

        tx.execute(
            "UPDATE job_slots SET target_key = ?1, handle = ?2 WHERE slot = ?3",
            params![job.key, job.handle, slot],
        )?;
        tx.commit()?;

        tracing::debug!(key = %job.key, handle = %job.handle, slot, "Job tracked");
        Ok(())
    }

    /// Free the slot holding `key`. Returns whether anything was removed;
    /// an absent key is not an error.
    pub fn remove_by_key(&self, key: &str) -> Result<bool, StoreError> {
        if key.is_empty() {
            return Ok(false);
        }
        let db = self.store.conn()?;
        let rows = db.execute(
            "UPDATE job_slots SET target_key = '', handle = '' WHERE target_key = ?1",
            params![key],
        )?;
        if rows > 0 {
            tracing::debug!(key = %key, "Job released");
        }
        Ok(rows > 0)
    }

    /// Snapshot of all outstanding jobs in slot order.
    pub fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let db = self.store.conn()?;
        let mut stmt = db.prepare(
            "SELECT target_key, handle FROM job_slots WHERE target_key != '' ORDER BY slot",
        )?;
        let jobs = stmt
            .query_map([], |row| {
                Ok(Job {
                    key: row.get(0)?,
                    handle: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if let Some(bad) = jobs.iter().find(|j| j.handle.is_empty()) {
            return Err(StoreError::Corrupt {
                table: "job_slots",
                detail: format!("target '{}' has no handle", bad.key),
            });
        }
        Ok(jobs)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.count()? == 0)
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let db = self.store.conn()?;
        let hit: Option<i64> = db
            .query_row(
                "SELECT slot FROM job_slots WHERE target_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let db = self.store.conn()?;
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM job_slots WHERE target_key != ''",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Slots still available under the configured capacity.
    pub fn free_slots(&self) -> Result<usize, StoreError> {
        Ok(self.store.capacity().saturating_sub(self.count()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(store: &Store) -> Vec<String> {
        store.jobs().list_all().unwrap().into_iter().map(|j| j.key).collect()
    }

    #[test]
    fn test_put_and_list_in_slot_order() {
        let store = Store::open_in_memory(10).unwrap();
        store.jobs().put(&Job::new("a.example", "h-a")).unwrap();
        store.jobs().put(&Job::new("b.example", "h-b")).unwrap();
        assert_eq!(keys(&store), vec!["a.example", "b.example"]);
        assert!(!store.jobs().is_empty().unwrap());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let store = Store::open_in_memory(10).unwrap();
        store.jobs().put(&Job::new("a.example", "h-1")).unwrap();
        let err = store.jobs().put(&Job::new("a.example", "h-2")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(k) if k == "a.example"));
        assert_eq!(store.jobs().list_all().unwrap(), vec![Job::new("a.example", "h-1")]);
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let store = Store::open_in_memory(10).unwrap();
        store.jobs().put(&Job::new("a.example", "h-a")).unwrap();
        assert!(!store.jobs().remove_by_key("missing.example").unwrap());
        assert!(!store.jobs().remove_by_key("").unwrap());
        assert_eq!(keys(&store), vec!["a.example"]);

        assert!(store.jobs().remove_by_key("a.example").unwrap());
        assert!(!store.jobs().remove_by_key("a.example").unwrap());
        assert!(store.jobs().is_empty().unwrap());
    }

    #[test]
    fn test_full_table_rejects_put() {
        let store = Store::open_in_memory(2).unwrap();
        store.jobs().put(&Job::new("a", "1")).unwrap();
        store.jobs().put(&Job::new("b", "2")).unwrap();
        assert_eq!(store.jobs().free_slots().unwrap(), 0);
        assert!(matches!(
            store.jobs().put(&Job::new("c", "3")),
            Err(StoreError::Full(2))
        ));
    }

    #[test]
    fn test_freed_slot_is_reused_first() {
        let store = Store::open_in_memory(3).unwrap();
        store.jobs().put(&Job::new("a", "1")).unwrap();
        store.jobs().put(&Job::new("b", "2")).unwrap();
        store.jobs().remove_by_key("a").unwrap();
        store.jobs().put(&Job::new("c", "3")).unwrap();
        assert_eq!(keys(&store), vec!["c", "b"]);
    }

    #[test]
    fn test_blank_fields_rejected() {
        let store = Store::open_in_memory(2).unwrap();
        assert!(matches!(store.jobs().put(&Job::new("", "h")), Err(StoreError::Blank("key"))));
        assert!(matches!(store.jobs().put(&Job::new("k", "")), Err(StoreError::Blank("handle"))));
    }

    #[test]
    fn test_snapshot_is_detached_from_later_writes() {
        let store = Store::open_in_memory(5).unwrap();
        store.jobs().put(&Job::new("a", "1")).unwrap();
        let snapshot = store.jobs().list_all().unwrap();
        store.jobs().remove_by_key("a").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(store.jobs().is_empty().unwrap());
    }

    #[test]
    fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speedwatch.db");
        {
            let store = Store::open(&path, 10).unwrap();
            store.jobs().put(&Job::new("a.example", "h-a")).unwrap();
        }
        let store = Store::open(&path, 10).unwrap();
        assert_eq!(store.jobs().list_all().unwrap(), vec![Job::new("a.example", "h-a")]);
        assert!(store.jobs().contains("a.example").unwrap());
    }

    #[test]
    fn test_lowered_capacity_counts_high_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speedwatch.db");
        {
            let store = Store::open(&path, 10).unwrap();
            for i in 0..10 {
                store.jobs().put(&Job::new(format!("t{i}.example"), format!("h{i}"))).unwrap();
            }
            for i in 0..5 {
                store.jobs().remove_by_key(&format!("t{i}.example")).unwrap();
            }
        }

        // Jobs in slots 5..9 sit above the new capacity but still fill it.
        let store = Store::open(&path, 5).unwrap();
        assert_eq!(store.jobs().count().unwrap(), 5);
        assert_eq!(store.jobs().free_slots().unwrap(), 0);
        assert!(matches!(
            store.jobs().put(&Job::new("new.example", "h-new")),
            Err(StoreError::Full(5))
        ));

        store.jobs().remove_by_key("t9.example").unwrap();
        assert_eq!(store.jobs().free_slots().unwrap(), 1);
        store.jobs().put(&Job::new("new.example", "h-new")).unwrap();
        assert_eq!(keys(&store).first().map(String::as_str), Some("new.example"));
        assert!(store.jobs().count().unwrap() <= store.capacity());
    }
}
