//! Poll scheduler: keeps exactly one periodic activation alive while
//! jobs are outstanding, and none otherwise.
//!
//! The activation itself comes from a [`Trigger`]: an in-process ticker
//! for the daemon, or a ledger row consulted by cron-driven `poll` runs.
//! Only the activation identifier is persisted, keyed by owner, so a
//! later process can find and retire an activation it did not create.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::store::Store;

pub mod interval;
pub mod ledger;

pub use interval::IntervalTrigger;
pub use ledger::{LedgerTrigger, PollGate};

/// Identifier of one standing periodic activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(String);

impl ActivationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ActivationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A time-based activation facility.
pub trait Trigger: Send + Sync {
    /// Start firing every `every`; returns the new activation's id.
    fn register(&self, every: Duration) -> Result<ActivationId>;

    /// Stop an activation. `Ok(false)` when the id is unknown.
    fn unregister(&self, id: &ActivationId) -> Result<bool>;
}

pub struct PollScheduler {
    store: Arc<Store>,
    trigger: Arc<dyn Trigger>,
    owner: String,
    every: Duration,
}

impl PollScheduler {
    pub fn new(store: Arc<Store>, trigger: Arc<dyn Trigger>, owner: impl Into<String>, every: Duration) -> Self {
        Self {
            store,
            trigger,
            owner: owner.into(),
            every,
        }
    }

    pub fn current_activation_id(&self) -> Result<Option<ActivationId>> {
        Ok(self
            .store
            .scheduler_state()
            .activation(&self.owner)?
            .map(ActivationId::from))
    }

    /// Replace any existing activation with a fresh one.
    pub fn ensure_active(&self) -> Result<ActivationId> {
        let state = self.store.scheduler_state();

        if let Some(old) = self.current_activation_id()? {
            let found = self.trigger.unregister(&old)?;
            if found {
                debug!(activation = %old, "Retired previous activation");
            } else {
                debug!(activation = %old, "Previous activation was already gone");
            }
            state.clear_activation(&self.owner)?;
        }

        let id = self.trigger.register(self.every)?;
        state.set_activation(&self.owner, id.as_str())?;

        info!(
            activation = %id,
            every_secs = self.every.as_secs(),
            "⏱️  Polling activated"
        );
        Ok(id)
    }

    /// Whether `id` is the activation currently persisted for this owner.
    /// Ticks from any other id come from a retired activation.
    pub fn is_current(&self, id: &ActivationId) -> Result<bool> {
        Ok(self.current_activation_id()?.as_ref() == Some(id))
    }

    /// Make this scheduler's trigger the only source of activations.
    ///
    /// Every ledger registration left by cron-mode runs is dropped, then
    /// polling is armed here if jobs are outstanding and switched off
    /// otherwise. Returns whether polling ended up active.
    pub fn take_over(&self, ledger: &LedgerTrigger) -> Result<bool> {
        let dropped = ledger.unregister_all()?;
        if dropped > 0 {
            info!(dropped, "Retired cron-mode activations");
        }

        if self.store.jobs().is_empty()? {
            self.deactivate()?;
            Ok(false)
        } else {
            self.ensure_active()?;
            Ok(true)
        }
    }

    /// Retire the persisted activation, if any. Returns whether a live
    /// activation was actually stopped.
    pub fn deactivate(&self) -> Result<bool> {
        let Some(id) = self.current_activation_id()? else {
            return Ok(false);
        };

        let stopped = self.trigger.unregister(&id);

        // A dangling id is cleared too, so the next ensure_active() starts clean.
        self.store.scheduler_state().clear_activation(&self.owner)?;

        match stopped {
            Ok(true) => {
                info!(activation = %id, "⏹️  Polling deactivated");
                Ok(true)
            }
            Ok(false) => {
                warn!(activation = %id, "Persisted activation was not registered; cleared");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
