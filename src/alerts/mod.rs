//! Alert sinks: where threshold violations go.
//!
//! Delivery is fire-and-forget from the poll cycle's point of view: a
//! failed notification is logged, never retried, and never aborts the
//! cycle.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::metrics::Violation;

pub mod email;

pub use email::EmailAlerts;

/// One completed test that breached at least one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub target: String,
    pub report_url: String,
    pub violations: Vec<Violation>,
}

impl Alert {
    pub fn subject(&self) -> String {
        let n = self.violations.len();
        format!(
            "[SpeedWatch] {} threshold{} exceeded for {}",
            n,
            if n == 1 { "" } else { "s" },
            self.target
        )
    }

    pub fn body(&self) -> String {
        let mut body = format!("Target: {}\n\n", self.target);
        for v in &self.violations {
            body.push_str(&format!("  - {}\n", v));
        }
        body.push_str(&format!("\nFull report: {}\n", self.report_url));
        body
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log only. Used when SMTP is not configured.
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let summary: Vec<String> = alert.violations.iter().map(ToString::to_string).collect();
        warn!(
            key = %alert.target,
            report = %alert.report_url,
            violations = %summary.join("; "),
            "🚨 Threshold exceeded"
        );
        Ok(())
    }
}
