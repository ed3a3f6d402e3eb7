//! Poll cycle: advances every outstanding job by one step.
//!
//! Each activation polls the jobs in slot order. Completed jobs leave the
//! store, land in the result log and are checked against the thresholds;
//! pending jobs stay put. When a cycle sees nothing pending and the store
//! is empty, polling is switched off until the next submission.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::config::ThresholdSource;
use crate::metrics::{evaluate, MetricRecord, ThresholdSet};
use crate::scheduler::PollScheduler;
use crate::service::{PollResult, TestService};
use crate::store::{CycleLease, Job, ResultSink, Store};

/// What happens to the rest of a cycle when one job fails to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failure; later jobs wait for the next activation.
    #[default]
    AbortCycle,
    /// Record the failure, keep the job outstanding, move on.
    IsolateJob,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("poll cycle could not start")]
    Prepare(#[source] anyhow::Error),

    #[error("poll cycle aborted at {target} after {completed} completion(s)")]
    Aborted {
        target: String,
        completed: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("poll cycle finished but polling could not be deactivated")]
    Deactivate(#[source] anyhow::Error),
}

impl CycleError {
    fn cause(&self) -> &anyhow::Error {
        match self {
            Self::Prepare(e) | Self::Deactivate(e) => e,
            Self::Aborted { source, .. } => source,
        }
    }

    fn target(&self) -> Option<&str> {
        match self {
            Self::Aborted { target, .. } => Some(target),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub completed: usize,
    pub pending: usize,
    /// Alerts handed to the alert sink (delivered or not).
    pub alerts: usize,
    /// Polling was switched off at the end of this cycle.
    pub deactivated: bool,
    /// Keys that failed under [`FailurePolicy::IsolateJob`].
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Ran(CycleReport),
    /// Another process holds the cycle lease.
    Skipped,
}

enum Step {
    Pending,
    Completed,
}

pub struct PollCycleRunner {
    store: Arc<Store>,
    service: Arc<dyn TestService>,
    scheduler: Arc<PollScheduler>,
    results: Arc<dyn ResultSink>,
    alerts: Arc<dyn AlertSink>,
    thresholds: Arc<dyn ThresholdSource>,
    policy: FailurePolicy,
    lease_ttl: Duration,
    holder: String,
}

impl PollCycleRunner {
    pub fn new(
        store: Arc<Store>,
        service: Arc<dyn TestService>,
        scheduler: Arc<PollScheduler>,
        results: Arc<dyn ResultSink>,
        alerts: Arc<dyn AlertSink>,
        thresholds: Arc<dyn ThresholdSource>,
    ) -> Self {
        Self {
            store,
            service,
            scheduler,
            results,
            alerts,
            thresholds,
            policy: FailurePolicy::default(),
            lease_ttl: Duration::from_secs(900),
            holder: format!("cycle-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Run one activation. Errors are logged and written to the result
    /// sink's error channel before being returned; the scheduler is left
    /// active so the next activation retries.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let lease = CycleLease::acquire(&self.store, &self.holder, self.lease_ttl)
            .map_err(|e| CycleError::Prepare(e.into()))?;
        let Some(lease) = lease else {
            let other = CycleLease::holder(&self.store).ok().flatten();
            info!(holder = ?other, "Another poll cycle is running — skipping this activation");
            return Ok(CycleOutcome::Skipped);
        };
        debug!(holder = lease.holder(), "Cycle lease acquired");

        match self.run_locked().await {
            Ok(report) => Ok(CycleOutcome::Ran(report)),
            Err(e) => {
                error!(key = ?e.target(), "❌ {}: {:#}", e, e.cause());
                let message = format!("{}: {:#}", e, e.cause());
                if let Err(sink_err) = self.results.record_error(e.target(), &message) {
                    warn!("Could not record cycle error: {}", sink_err);
                }
                Err(e)
            }
        }
    }

    async fn run_locked(&self) -> Result<CycleReport, CycleError> {
        let thresholds = self.thresholds.load().map_err(CycleError::Prepare)?;
        let snapshot = self
            .store
            .jobs()
            .list_all()
            .map_err(|e| CycleError::Prepare(e.into()))?;

        info!(jobs = snapshot.len(), "🔄 Poll cycle starting");

        let mut report = CycleReport::default();
        let mut pending_observed = false;

        for job in &snapshot {
            match self.advance(job, &thresholds, &mut report).await {
                Ok(Step::Pending) => {
                    pending_observed = true;
                    report.pending += 1;
                }
                Ok(Step::Completed) => report.completed += 1,
                Err(e) => match self.policy {
                    FailurePolicy::AbortCycle => {
                        return Err(CycleError::Aborted {
                            target: job.key.clone(),
                            completed: report.completed,
                            source: e,
                        });
                    }
                    FailurePolicy::IsolateJob => {
                        warn!(key = %job.key, handle = %job.handle, "Job failed this cycle, leaving it outstanding: {:#}", e);
                        if let Err(sink_err) = self.results.record_error(Some(&job.key), &format!("{:#}", e)) {
                            warn!("Could not record job error: {}", sink_err);
                        }
                        pending_observed = true;
                        report.failed.push(job.key.clone());
                    }
                },
            }
        }

        if !pending_observed {
            let empty = self
                .store
                .jobs()
                .is_empty()
                .map_err(|e| CycleError::Deactivate(e.into()))?;
            if empty {
                self.scheduler.deactivate().map_err(CycleError::Deactivate)?;
                report.deactivated = true;
            } else {
                debug!("Jobs were added during the cycle — polling stays active");
            }
        }

        info!(
            completed = report.completed,
            pending = report.pending,
            failed = report.failed.len(),
            alerts = report.alerts,
            "Poll cycle finished"
        );
        Ok(report)
    }

    async fn advance(&self, job: &Job, thresholds: &ThresholdSet, report: &mut CycleReport) -> Result<Step> {
        let polled = self
            .service
            .poll(&job.handle)
            .await
            .with_context(|| format!("polling {} ({})", job.key, job.handle))?;

        let test = match polled {
            PollResult::Pending { .. } => {
                debug!(key = %job.key, "Still running");
                return Ok(Step::Pending);
            }
            PollResult::Completed(test) => test,
            PollResult::Malformed { reason } => {
                anyhow::bail!("unusable response for {} ({}): {}", job.key, job.handle, reason);
            }
        };

        self.store.jobs().remove_by_key(&job.key)?;
        let record = MetricRecord {
            target: job.key.clone(),
            completed_at: test.completed_at,
            metrics: test.metrics,
            report_url: test.report_url,
        };
        self.results
            .append(&record)
            .with_context(|| format!("recording result for {}", job.key))?;

        let violations = evaluate(&record.metrics, thresholds.limits());
        info!(key = %job.key, violations = violations.len(), report = %record.report_url, "✅ Test completed");

        if !violations.is_empty() {
            let alert = Alert {
                target: record.target,
                report_url: record.report_url,
                violations,
            };
            report.alerts += 1;
            if let Err(e) = self.alerts.notify(&alert).await {
                warn!(key = %alert.target, "Alert delivery failed: {:#}", e);
            }
        }
        Ok(Step::Completed)
    }
}
