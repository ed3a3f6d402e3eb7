//! Fakes shared by the submitter, scheduler, and cycle tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::alerts::{Alert, AlertSink};
use crate::metrics::METRIC_COUNT;
use crate::scheduler::{ActivationId, Trigger};
use crate::service::{CompletedTest, PollResult, SubmitResult, TestService};

// ── Trigger ─────────────────────────────────────────────────────────

/// Registrations are just remembered; tests "fire" by calling the cycle.
#[derive(Default)]
pub struct ManualTrigger {
    active: Mutex<Vec<ActivationId>>,
    unregister_calls: AtomicUsize,
}

impl ManualTrigger {
    pub fn registered(&self) -> Vec<ActivationId> {
        self.active.lock().unwrap().clone()
    }

    pub fn is_firing(&self) -> bool {
        !self.active.lock().unwrap().is_empty()
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }
}

impl Trigger for ManualTrigger {
    fn register(&self, _every: Duration) -> Result<ActivationId> {
        let id = ActivationId::generate();
        self.active.lock().unwrap().push(id.clone());
        Ok(id)
    }

    fn unregister(&self, id: &ActivationId) -> Result<bool> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap();
        let before = active.len();
        active.retain(|a| a != id);
        Ok(active.len() != before)
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// Accepts every submission unless told otherwise; each handle replays a
/// scripted queue of poll results and reports `Pending` once it runs dry.
#[derive(Default)]
pub struct FakeService {
    rejections: Mutex<HashMap<String, u16>>,
    unreachable: Mutex<HashSet<String>>,
    polls: Mutex<HashMap<String, VecDeque<PollResult>>>,
    broken_polls: Mutex<HashSet<String>>,
    submitted: Mutex<Vec<String>>,
    polled: Mutex<Vec<String>>,
}

impl FakeService {
    pub fn handle_for(url: &str) -> String {
        format!("wpt://{url}")
    }

    pub fn reject(&self, url: &str, status: u16) {
        self.rejections.lock().unwrap().insert(url.to_string(), status);
    }

    pub fn make_unreachable(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    /// Queue poll results for `url`'s handle.
    pub fn script(&self, url: &str, results: Vec<PollResult>) {
        self.polls
            .lock()
            .unwrap()
            .entry(Self::handle_for(url))
            .or_default()
            .extend(results);
    }

    /// Make polls of `url`'s handle fail at the transport level.
    pub fn break_poll(&self, url: &str) {
        self.broken_polls.lock().unwrap().insert(Self::handle_for(url));
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn polled(&self) -> Vec<String> {
        self.polled.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestService for FakeService {
    fn name(&self) -> &str {
        "fake"
    }

    async fn submit(&self, url: &str) -> Result<SubmitResult> {
        self.submitted.lock().unwrap().push(url.to_string());
        if self.unreachable.lock().unwrap().contains(url) {
            anyhow::bail!("connection refused");
        }
        if let Some(status) = self.rejections.lock().unwrap().get(url) {
            return Ok(SubmitResult::Rejected {
                status: *status,
                message: "rejected by fake".into(),
            });
        }
        Ok(SubmitResult::Accepted {
            handle: Self::handle_for(url),
        })
    }

    async fn poll(&self, handle: &str) -> Result<PollResult> {
        self.polled.lock().unwrap().push(handle.to_string());
        if self.broken_polls.lock().unwrap().contains(handle) {
            anyhow::bail!("connection reset");
        }
        let next = self
            .polls
            .lock()
            .unwrap()
            .get_mut(handle)
            .and_then(|q| q.pop_front());
        Ok(next.unwrap_or_else(|| PollResult::Pending {
            target: handle.trim_start_matches("wpt://").to_string(),
        }))
    }
}

pub fn pending(url: &str) -> PollResult {
    PollResult::Pending { target: url.to_string() }
}

pub fn completed(url: &str, metrics: [f64; METRIC_COUNT]) -> PollResult {
    PollResult::Completed(CompletedTest {
        target: url.to_string(),
        completed_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        metrics,
        report_url: format!("https://wpt.example/result/{url}/"),
    })
}

// ── Alerts ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingAlerts {
    sent: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingAlerts {
    pub fn sent(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        self.sent.lock().unwrap().push(alert.clone());
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("smtp unavailable");
        }
        Ok(())
    }
}
