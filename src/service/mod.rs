//! Testing-service trait: the submit/poll boundary.
//!
//! The cycle runner and submitter only ever talk to a `TestService`;
//! transport, authentication, and response decoding stay behind it.
//! Transport failures come back as `Err`, while everything the service
//! actually said is folded into the tagged result types below.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::METRIC_COUNT;

pub mod webpagetest;

// ── Core Types ──────────────────────────────────────────────────────

/// Outcome of one submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitResult {
    /// The test was queued; poll `handle` for progress.
    Accepted { handle: String },
    /// The service refused the request.
    Rejected { status: u16, message: String },
}

/// Outcome of one poll request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PollResult {
    /// Still queued or running.
    Pending { target: String },
    /// Finished, with the median first-view bundle.
    Completed(CompletedTest),
    /// The response could not be understood, or reported a service error.
    Malformed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTest {
    /// Target as echoed back by the service.
    pub target: String,
    pub completed_at: DateTime<Utc>,
    /// Values in `METRIC_SCHEMA` order.
    pub metrics: [f64; METRIC_COUNT],
    /// Human-viewable report.
    pub report_url: String,
}

// ── Service Trait ───────────────────────────────────────────────────

#[async_trait]
pub trait TestService: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Queue a measurement of `url`.
    async fn submit(&self, url: &str) -> Result<SubmitResult>;

    /// Check on a previously accepted test.
    async fn poll(&self, handle: &str) -> Result<PollResult>;
}
