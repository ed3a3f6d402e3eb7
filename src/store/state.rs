//! Persisted scheduling state and the poll-cycle lease.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

use super::{epoch_ms, Store, StoreError};

const CYCLE_LEASE: &str = "poll-cycle";

/// Owner → active-activation-id pairs.
pub struct SchedulerState<'a> {
    store: &'a Store,
}

impl<'a> SchedulerState<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn activation(&self, owner: &str) -> Result<Option<String>, StoreError> {
        let db = self.store.conn()?;
        let id = db
            .query_row(
                "SELECT activation_id FROM scheduler_state WHERE owner = ?1",
                params![owner],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id.filter(|id| !id.is_empty()))
    }

    pub fn set_activation(&self, owner: &str, activation_id: &str) -> Result<(), StoreError> {
        let db = self.store.conn()?;
        db.execute(
            "INSERT INTO scheduler_state (owner, activation_id) VALUES (?1, ?2)
             ON CONFLICT(owner) DO UPDATE SET activation_id = excluded.activation_id",
            params![owner, activation_id],
        )?;
        Ok(())
    }

    /// Returns whether an identifier was present.
    pub fn clear_activation(&self, owner: &str) -> Result<bool, StoreError> {
        let db = self.store.conn()?;
        let rows = db.execute("DELETE FROM scheduler_state WHERE owner = ?1", params![owner])?;
        Ok(rows > 0)
    }
}

/// Cross-process mutual exclusion for poll cycles.
///
/// Only one holder may run a cycle at a time; a lease whose TTL has
/// passed is considered abandoned and can be taken over.
pub struct CycleLease;

impl CycleLease {
    /// Try to take the lease. `None` means someone else holds it.
    pub fn acquire<'a>(
        store: &'a Store,
        holder: &str,
        ttl: std::time::Duration,
    ) -> Result<Option<LeaseGuard<'a>>, StoreError> {
        let now = Utc::now();
        let ttl = Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(1));
        let expires = epoch_ms(now + ttl);

        let db = store.conn()?;
        let rows = db.execute(
            "INSERT INTO cycle_lease (name, holder, expires_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_ms = excluded.expires_ms
             WHERE cycle_lease.expires_ms <= ?4 OR cycle_lease.holder = excluded.holder",
            params![CYCLE_LEASE, holder, expires, epoch_ms(now)],
        )?;

        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(LeaseGuard {
            store,
            holder: holder.to_string(),
        }))
    }

    /// Current holder, if the lease is live.
    pub fn holder(store: &Store) -> Result<Option<String>, StoreError> {
        let db = store.conn()?;
        let holder = db
            .query_row(
                "SELECT holder FROM cycle_lease WHERE name = ?1 AND expires_ms > ?2",
                params![CYCLE_LEASE, epoch_ms(Utc::now())],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }
}

/// Releases the cycle lease on drop.
pub struct LeaseGuard<'a> {
    store: &'a Store,
    holder: String,
}

impl LeaseGuard<'_> {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        let released = self.store.conn().and_then(|db| {
            db.execute(
                "DELETE FROM cycle_lease WHERE name = ?1 AND holder = ?2",
                params![CYCLE_LEASE, self.holder],
            )
            .map_err(StoreError::from)
        });
        if let Err(e) = released {
            tracing::warn!(holder = %self.holder, "Failed to release cycle lease: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_activation_roundtrip_per_owner() {
        let store = Store::open_in_memory(1).unwrap();
        let state = store.scheduler_state();
        assert_eq!(state.activation("speedwatch").unwrap(), None);

        state.set_activation("speedwatch", "act-1").unwrap();
        state.set_activation("speedwatch", "act-2").unwrap();
        state.set_activation("other", "act-9").unwrap();
        assert_eq!(state.activation("speedwatch").unwrap().as_deref(), Some("act-2"));

        assert!(state.clear_activation("speedwatch").unwrap());
        assert!(!state.clear_activation("speedwatch").unwrap());
        assert_eq!(state.activation("speedwatch").unwrap(), None);
        assert_eq!(state.activation("other").unwrap().as_deref(), Some("act-9"));
    }

    #[test]
    fn test_lease_is_exclusive_until_released() {
        let store = Store::open_in_memory(1).unwrap();
        let ttl = StdDuration::from_secs(60);

        let guard = CycleLease::acquire(&store, "proc-a", ttl).unwrap().unwrap();
        assert!(CycleLease::acquire(&store, "proc-b", ttl).unwrap().is_none());
        assert_eq!(CycleLease::holder(&store).unwrap().as_deref(), Some("proc-a"));

        drop(guard);
        assert_eq!(CycleLease::holder(&store).unwrap(), None);
        assert!(CycleLease::acquire(&store, "proc-b", ttl).unwrap().is_some());
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = Store::open_in_memory(1).unwrap();
        let stale = CycleLease::acquire(&store, "crashed", StdDuration::ZERO).unwrap().unwrap();
        std::mem::forget(stale);

        let guard = CycleLease::acquire(&store, "fresh", StdDuration::from_secs(60)).unwrap();
        assert_eq!(guard.as_ref().map(|g| g.holder()), Some("fresh"));
    }
}
