//! Durable activations for cron-driven deployments.
//!
//! No process stays alive between polls, so a registration is just a row
//! recording the interval and when it is next due. Whatever runs
//! `speedwatch poll` (cron, a systemd timer) asks [`LedgerTrigger::claim_due`]
//! whether the current activation should fire now.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

use super::{ActivationId, PollScheduler, Trigger};
use crate::store::{epoch_ms, Store};

/// What a cron-driven `poll` run should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollGate {
    /// The activation was due and has been claimed; run a cycle.
    Run,
    /// Registered here but not due yet.
    NotDue { next_due: Option<DateTime<Utc>> },
    /// The persisted activation is not a ledger row, so a daemon owns it.
    Foreign(ActivationId),
    /// Polling is off and nothing is outstanding.
    Idle,
    /// Jobs are outstanding but polling is off.
    Rearm,
}

pub struct LedgerTrigger {
    store: Arc<Store>,
}

impl LedgerTrigger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// If `id` is registered and due at `now`, advance its next due time
    /// by one interval and return `true`.
    pub fn claim_due(&self, id: &ActivationId, now: DateTime<Utc>) -> Result<bool> {
        let db = self.store.conn()?;
        let now_ms = epoch_ms(now);
        let rows = db.execute(
            "UPDATE activations SET next_due_ms = ?2 + interval_secs * 1000
             WHERE id = ?1 AND next_due_ms <= ?2",
            params![id.as_str(), now_ms],
        )?;
        Ok(rows > 0)
    }

    pub fn is_registered(&self, id: &ActivationId) -> Result<bool> {
        let db = self.store.conn()?;
        let hit: Option<String> = db
            .query_row(
                "SELECT id FROM activations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    /// When `id` next fires, if registered.
    pub fn next_due(&self, id: &ActivationId) -> Result<Option<DateTime<Utc>>> {
        let db = self.store.conn()?;
        let ms: Option<i64> = db
            .query_row(
                "SELECT next_due_ms FROM activations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms.and_then(DateTime::<Utc>::from_timestamp_millis))
    }

    /// Decide whether `scheduler`'s activation fires at `now`, claiming it
    /// if so.
    pub fn gate(&self, scheduler: &PollScheduler, now: DateTime<Utc>) -> Result<PollGate> {
        let Some(id) = scheduler.current_activation_id()? else {
            if self.store.jobs().is_empty()? {
                return Ok(PollGate::Idle);
            }
            return Ok(PollGate::Rearm);
        };

        if self.claim_due(&id, now)? {
            return Ok(PollGate::Run);
        }
        if self.is_registered(&id)? {
            return Ok(PollGate::NotDue {
                next_due: self.next_due(&id)?,
            });
        }
        Ok(PollGate::Foreign(id))
    }

    /// Drop every registration. Returns how many rows went.
    pub fn unregister_all(&self) -> Result<usize> {
        let db = self.store.conn()?;
        Ok(db.execute("DELETE FROM activations", [])?)
    }

    fn register_at(&self, every: Duration, now: DateTime<Utc>) -> Result<ActivationId> {
        let id = ActivationId::generate();
        let interval_secs = i64::try_from(every.as_secs().max(1))?;
        let db = self.store.conn()?;
        db.execute(
            "INSERT INTO activations (id, interval_secs, registered_at, next_due_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.as_str(),
                interval_secs,
                now.to_rfc3339(),
                epoch_ms(now) + interval_secs * 1000
            ],
        )?;
        Ok(id)
    }
}

impl Trigger for LedgerTrigger {
    fn register(&self, every: Duration) -> Result<ActivationId> {
        self.register_at(every, Utc::now())
    }

    fn unregister(&self, id: &ActivationId) -> Result<bool> {
        let db = self.store.conn()?;
        let rows = db.execute("DELETE FROM activations WHERE id = ?1", params![id.as_str()])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_366_400 + secs, 0).unwrap()
    }

    #[test]
    fn test_due_only_after_full_interval() {
        let store = Arc::new(Store::open_in_memory(1).unwrap());
        let ledger = LedgerTrigger::new(store);
        let id = ledger.register_at(Duration::from_secs(300), t(0)).unwrap();

        assert!(!ledger.claim_due(&id, t(299)).unwrap());
        assert!(ledger.claim_due(&id, t(300)).unwrap());
        // Claimed: not due again until the next interval
        assert!(!ledger.claim_due(&id, t(301)).unwrap());
        assert_eq!(ledger.next_due(&id).unwrap(), Some(t(600)));
        assert!(ledger.claim_due(&id, t(900)).unwrap());
    }

    #[test]
    fn test_unregister_removes_row() {
        let store = Arc::new(Store::open_in_memory(1).unwrap());
        let ledger = LedgerTrigger::new(Arc::clone(&store));
        let id = ledger.register(Duration::from_secs(60)).unwrap();
        assert!(ledger.is_registered(&id).unwrap());

        assert!(ledger.unregister(&id).unwrap());
        assert!(!ledger.unregister(&id).unwrap());
        assert!(!ledger.claim_due(&id, Utc::now() + chrono::Duration::hours(1)).unwrap());
        assert_eq!(ledger.next_due(&id).unwrap(), None);
    }

    fn cron_scheduler(store: &Arc<Store>) -> (Arc<LedgerTrigger>, PollScheduler) {
        let ledger = Arc::new(LedgerTrigger::new(Arc::clone(store)));
        let scheduler = PollScheduler::new(Arc::clone(store), ledger.clone(), "speedwatch", Duration::from_secs(300));
        (ledger, scheduler)
    }

    #[test]
    fn test_gate_idle_without_jobs_or_activation() {
        let store = Arc::new(Store::open_in_memory(2).unwrap());
        let (ledger, scheduler) = cron_scheduler(&store);
        assert_eq!(ledger.gate(&scheduler, Utc::now()).unwrap(), PollGate::Idle);
    }

    #[test]
    fn test_gate_rearms_orphaned_jobs_then_runs_when_due() {
        let store = Arc::new(Store::open_in_memory(2).unwrap());
        store.jobs().put(&crate::store::Job::new("a.example", "h-a")).unwrap();
        let (ledger, scheduler) = cron_scheduler(&store);

        assert_eq!(ledger.gate(&scheduler, Utc::now()).unwrap(), PollGate::Rearm);
        let id = scheduler.ensure_active().unwrap();
        assert!(ledger.is_registered(&id).unwrap());

        assert!(matches!(
            ledger.gate(&scheduler, Utc::now()).unwrap(),
            PollGate::NotDue { next_due: Some(_) }
        ));

        let later = Utc::now() + chrono::Duration::seconds(301);
        assert_eq!(ledger.gate(&scheduler, later).unwrap(), PollGate::Run);
        // Claimed: the same instant does not fire twice.
        assert!(matches!(ledger.gate(&scheduler, later).unwrap(), PollGate::NotDue { .. }));
    }

    #[test]
    fn test_gate_leaves_daemon_activation_alone() {
        let store = Arc::new(Store::open_in_memory(2).unwrap());
        store.jobs().put(&crate::store::Job::new("a.example", "h-a")).unwrap();
        let daemon_trigger = Arc::new(crate::testing::ManualTrigger::default());
        let daemon = PollScheduler::new(Arc::clone(&store), daemon_trigger.clone(), "speedwatch", Duration::from_secs(300));
        let daemon_id = daemon.ensure_active().unwrap();

        let (ledger, scheduler) = cron_scheduler(&store);
        let far_future = Utc::now() + chrono::Duration::days(1);
        assert_eq!(ledger.gate(&scheduler, far_future).unwrap(), PollGate::Foreign(daemon_id.clone()));

        // Nothing was claimed or retired.
        assert!(!ledger.is_registered(&daemon_id).unwrap());
        assert_eq!(daemon_trigger.registered(), vec![daemon_id.clone()]);
        assert_eq!(scheduler.current_activation_id().unwrap(), Some(daemon_id));
    }

    #[test]
    fn test_unregister_all_clears_every_row() {
        let store = Arc::new(Store::open_in_memory(1).unwrap());
        let ledger = LedgerTrigger::new(store);
        let a = ledger.register(Duration::from_secs(60)).unwrap();
        let b = ledger.register(Duration::from_secs(60)).unwrap();

        assert_eq!(ledger.unregister_all().unwrap(), 2);
        assert!(!ledger.is_registered(&a).unwrap());
        assert!(!ledger.is_registered(&b).unwrap());
        assert_eq!(ledger.unregister_all().unwrap(), 0);
    }

    #[test]
    fn test_registration_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speedwatch.db");
        let id = {
            let ledger = LedgerTrigger::new(Arc::new(Store::open(&path, 1).unwrap()));
            ledger.register_at(Duration::from_secs(60), t(0)).unwrap()
        };
        let ledger = LedgerTrigger::new(Arc::new(Store::open(&path, 1).unwrap()));
        assert!(ledger.is_registered(&id).unwrap());
        assert!(ledger.claim_due(&id, t(60)).unwrap());
    }
}
