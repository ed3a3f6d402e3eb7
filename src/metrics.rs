//! Metric schema and threshold evaluation.
//!
//! Every completed test yields the same nine first-view metrics, in a
//! fixed order. Thresholds are positionally aligned with that order and
//! a metric that *reaches* its limit counts as a violation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const METRIC_COUNT: usize = 9;

/// One column of the fixed metric schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricField {
    /// Stable key used in config files and the result log.
    pub key: &'static str,
    /// Field names in the service's median first-view bundle, tried in order.
    pub sources: &'static [&'static str],
    /// Human-readable name for alert text.
    pub name: &'static str,
    /// Unit label for alert text (may be empty).
    pub units: &'static str,
}

pub const METRIC_SCHEMA: [MetricField; METRIC_COUNT] = [
    MetricField { key: "requests", sources: &["requestsFull", "requests"], name: "Requests", units: "" },
    MetricField { key: "bytes_in", sources: &["bytesIn"], name: "Bytes In", units: "bytes" },
    MetricField { key: "speed_index", sources: &["SpeedIndex"], name: "Webpagetest Speed Index", units: "" },
    MetricField { key: "first_paint", sources: &["firstPaint"], name: "First Paint", units: "ms" },
    MetricField { key: "visual_complete", sources: &["visualComplete"], name: "Visually Complete", units: "ms" },
    MetricField { key: "fully_loaded", sources: &["fullyLoaded"], name: "Fully Loaded", units: "ms" },
    MetricField { key: "image_total", sources: &["image_total"], name: "Image Bytes", units: "bytes" },
    MetricField { key: "image_savings", sources: &["image_savings"], name: "Image Compression Savings", units: "bytes" },
    MetricField { key: "gzip_savings", sources: &["gzip_savings"], name: "Gzip Savings", units: "bytes" },
];

/// Result of one completed job. Appended to the result log exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub target: String,
    pub completed_at: DateTime<Utc>,
    pub metrics: [f64; METRIC_COUNT],
    pub report_url: String,
}

/// A single metric that met or exceeded its limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub name: &'static str,
    pub units: &'static str,
    pub observed: f64,
    pub threshold: f64,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.units.is_empty() {
            write!(f, "{}: {} (threshold {})", self.name, self.observed, self.threshold)
        } else {
            write!(
                f,
                "{}: {} {} (threshold {} {})",
                self.name, self.observed, self.units, self.threshold, self.units
            )
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThresholdError {
    #[error("expected {expected} thresholds, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("unknown metric '{0}' in thresholds")]
    UnknownMetric(String),

    #[error("threshold for '{0}' is not a number")]
    NotANumber(String),
}

/// Ordered limits, one per schema position.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    limits: [f64; METRIC_COUNT],
}

impl ThresholdSet {
    pub fn new(limits: Vec<f64>) -> Result<Self, ThresholdError> {
        let actual = limits.len();
        let limits: [f64; METRIC_COUNT] = limits.try_into().map_err(|_| ThresholdError::Length {
            expected: METRIC_COUNT,
            actual,
        })?;
        if let Some(i) = limits.iter().position(|l| l.is_nan()) {
            return Err(ThresholdError::NotANumber(METRIC_SCHEMA[i].key.to_string()));
        }
        Ok(Self { limits })
    }

    /// Build from a `metric-key → limit` map. Absent keys are unbounded.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Result<Self, ThresholdError> {
        if let Some(unknown) = map.keys().find(|k| !METRIC_SCHEMA.iter().any(|f| f.key == k.as_str())) {
            return Err(ThresholdError::UnknownMetric(unknown.clone()));
        }
        let limits = METRIC_SCHEMA
            .iter()
            .map(|f| map.get(f.key).copied().unwrap_or(f64::INFINITY))
            .collect();
        Self::new(limits)
    }

    pub fn limits(&self) -> &[f64] {
        &self.limits
    }
}

/// Compare `metrics` against `thresholds` position by position.
///
/// Both slices must be schema-length; anything else is a configuration
/// bug upstream and panics.
pub fn evaluate(metrics: &[f64], thresholds: &[f64]) -> Vec<Violation> {
    assert_eq!(
        metrics.len(),
        thresholds.len(),
        "metric and threshold vectors differ in length"
    );
    assert_eq!(metrics.len(), METRIC_COUNT, "metric vector does not match schema");

    METRIC_SCHEMA
        .iter()
        .zip(metrics.iter().zip(thresholds))
        .filter(|(_, (observed, limit))| observed >= limit)
        .map(|(field, (&observed, &threshold))| Violation {
            name: field.name,
            units: field.units,
            observed,
            threshold,
        })
        .collect()
}
