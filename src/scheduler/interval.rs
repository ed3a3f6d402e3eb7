//! In-process activations for the daemon.
//!
//! Each registration spawns a ticker task that sends its activation id on
//! a channel every interval. The daemon loop owns the receiving end and
//! runs a poll cycle per tick; a tick whose id no longer matches the
//! persisted activation is ignored.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::{ActivationId, Trigger};

pub struct IntervalTrigger {
    ticks: mpsc::UnboundedSender<ActivationId>,
    tasks: Mutex<HashMap<ActivationId, JoinHandle<()>>>,
}

impl IntervalTrigger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ActivationId>) {
        let (ticks, rx) = mpsc::unbounded_channel();
        let trigger = Self {
            ticks,
            tasks: Mutex::new(HashMap::new()),
        };
        (trigger, rx)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Trigger for IntervalTrigger {
    /// Spawns onto the current tokio runtime.
    fn register(&self, every: Duration) -> Result<ActivationId> {
        let id = ActivationId::generate();
        let tx = self.ticks.clone();
        let tick_id = id.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // first tick is immediate; wait a full period

            loop {
                interval.tick().await;
                if tx.send(tick_id.clone()).is_err() {
                    break;
                }
            }
        });

        self.tasks
            .lock()
            .map_err(|_| anyhow::anyhow!("interval trigger mutex poisoned"))?
            .insert(id.clone(), handle);
        Ok(id)
    }

    fn unregister(&self, id: &ActivationId) -> Result<bool> {
        let handle = self
            .tasks
            .lock()
            .map_err(|_| anyhow::anyhow!("interval trigger mutex poisoned"))?
            .remove(id);
        match handle {
            Some(handle) => {
                handle.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for IntervalTrigger {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}
