//! Job submitter: turns requested targets into tracked jobs.
//!
//! Per-target problems (bad URL, already outstanding, service refusal,
//! unreachable service) are collected in the report and never stop the
//! remaining targets. Store failures are fatal and propagate.

use anyhow::Result;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{error, info, warn};

use crate::scheduler::PollScheduler;
use crate::service::{SubmitResult, TestService};
use crate::store::{Job, Store, StoreError};

/// Scheme-optional URL: host name, `localhost`, or dotted IPv4, then an
/// optional port and an optional path/query/fragment.
static TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^
        (?:(?:https?|ftp)://)?
        (?:
            (?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}
          | localhost
          | (?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)
        )
        (?::\d{1,5})?
        (?:[/?\#]\S*)?
        $",
    )
    .expect("valid regex")
});

pub fn is_valid_target(target: &str) -> bool {
    TARGET_RE.is_match(target)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Failed the URL-shape check; the service was never called.
    InvalidTarget,
    /// A job for this target is already outstanding (or appeared twice in
    /// the same request).
    AlreadyOutstanding,
    /// No free job slots were left.
    OverCapacity,
    /// The service answered with a non-success status.
    ServiceRejected { status: u16, message: String },
    /// The service could not be reached.
    Unreachable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget => f.write_str("not a valid URL"),
            Self::AlreadyOutstanding => f.write_str("already being tested"),
            Self::OverCapacity => f.write_str("job table full"),
            Self::ServiceRejected { status, message } => write!(f, "service returned {}: {}", status, message),
            Self::Unreachable(e) => write!(f, "service unreachable: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub target: String,
    pub reason: RejectReason,
}

#[derive(Debug, Default)]
pub struct SubmitReport {
    pub submitted: Vec<Job>,
    pub rejected: Vec<Rejection>,
}

pub struct JobSubmitter {
    store: Arc<Store>,
    service: Arc<dyn TestService>,
    scheduler: Arc<PollScheduler>,
}

impl JobSubmitter {
    pub fn new(store: Arc<Store>, service: Arc<dyn TestService>, scheduler: Arc<PollScheduler>) -> Self {
        Self {
            store,
            service,
            scheduler,
        }
    }

    pub async fn submit(&self, targets: &[String]) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        let mut seen = HashSet::new();
        let free = self.store.jobs().free_slots()?;

        for raw in targets {
            let target = raw.trim();
            let reject = |reason| Rejection {
                target: target.to_string(),
                reason,
            };

            if !is_valid_target(target) {
                warn!(key = %target, "Skipping malformed target");
                report.rejected.push(reject(RejectReason::InvalidTarget));
                continue;
            }
            if !seen.insert(target.to_string()) || self.store.jobs().contains(target)? {
                info!(key = %target, "Target already has an outstanding job — not resubmitting");
                report.rejected.push(reject(RejectReason::AlreadyOutstanding));
                continue;
            }
            if report.submitted.len() >= free {
                report.rejected.push(reject(RejectReason::OverCapacity));
                continue;
            }

            match self.service.submit(target).await {
                Ok(SubmitResult::Accepted { handle }) => {
                    let job = Job::new(target, handle);
                    if let Err(e) = self.store.jobs().put(&job) {
                        if let StoreError::DuplicateKey(_) = e {
                            error!(key = %target, "Duplicate job slipped past the outstanding check");
                        }
                        return Err(e.into());
                    }
                    info!(key = %target, handle = %job.handle, "📤 Test submitted");
                    report.submitted.push(job);
                }
                Ok(SubmitResult::Rejected { status, message }) => {
                    warn!(key = %target, status, "Submission rejected: {}", message);
                    report
                        .rejected
                        .push(reject(RejectReason::ServiceRejected { status, message }));
                }
                Err(e) => {
                    warn!(key = %target, service = self.service.name(), "Submission failed: {}", e);
                    report.rejected.push(reject(RejectReason::Unreachable(e.to_string())));
                }
            }
        }

        let over = report
            .rejected
            .iter()
            .filter(|r| r.reason == RejectReason::OverCapacity)
            .count();
        if over > 0 {
            warn!(skipped = over, capacity = self.store.capacity(), "Job table full — remaining targets not attempted");
        }

        if !report.submitted.is_empty() {
            self.scheduler.ensure_active()?;
        }

        info!(
            submitted = report.submitted.len(),
            rejected = report.rejected.len(),
            "Submission run complete"
        );
        Ok(report)
    }
}
