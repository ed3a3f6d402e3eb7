//! WebPageTest client: runtest.php submission and JSON result polling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use super::{CompletedTest, PollResult, SubmitResult, TestService};
use crate::config::ServiceConfig;
use crate::metrics::{METRIC_COUNT, METRIC_SCHEMA};

pub struct WebPageTestClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    location: String,
    mobile: bool,
    first_view_only: bool,
}

impl WebPageTestClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("speedwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            location: config.location.clone(),
            mobile: config.mobile,
            first_view_only: config.first_view_only,
        })
    }

    fn flag(on: bool) -> &'static str {
        if on { "1" } else { "0" }
    }
}

#[async_trait]
impl TestService for WebPageTestClient {
    fn name(&self) -> &str {
        "webpagetest"
    }

    async fn submit(&self, url: &str) -> Result<SubmitResult> {
        let mut query = vec![
            ("url", url),
            ("location", self.location.as_str()),
            ("fvonly", Self::flag(self.first_view_only)),
            ("mobile", Self::flag(self.mobile)),
            ("runs", "1"),
            ("f", "json"),
        ];
        if let Some(key) = &self.api_key {
            query.push(("k", key.as_str()));
        }

        let resp = self
            .client
            .get(format!("{}/runtest.php", self.base_url))
            .query(&query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(SubmitResult::Rejected {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body: Value = resp.json().await.context("runtest.php returned non-JSON body")?;
        Ok(parse_submit_response(&body, &self.base_url))
    }

    async fn poll(&self, handle: &str) -> Result<PollResult> {
        let resp = self.client.get(handle).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("poll of {} failed with HTTP {}", handle, status.as_u16());
        }
        let body: Value = resp.json().await.context("result endpoint returned non-JSON body")?;
        Ok(parse_poll_response(&body))
    }
}

// ── Response Parsing ────────────────────────────────────────────────

fn status_code(body: &Value) -> Option<u64> {
    body["statusCode"].as_u64()
}

fn status_text(body: &Value) -> String {
    body["statusText"].as_str().unwrap_or("no status text").to_string()
}

pub fn parse_submit_response(body: &Value, base_url: &str) -> SubmitResult {
    match status_code(body) {
        Some(200) => {
            let data = &body["data"];
            let handle = data["jsonUrl"]
                .as_str()
                .map(String::from)
                .or_else(|| {
                    data["testId"]
                        .as_str()
                        .map(|id| format!("{}/jsonResult.php?test={}", base_url, id))
                });
            match handle {
                Some(handle) => SubmitResult::Accepted { handle },
                None => SubmitResult::Rejected {
                    status: 200,
                    message: "accepted without a test id".into(),
                },
            }
        }
        Some(code) => SubmitResult::Rejected {
            status: u16::try_from(code).unwrap_or(u16::MAX),
            message: status_text(body),
        },
        None => SubmitResult::Rejected {
            status: 0,
            message: "response has no statusCode".into(),
        },
    }
}

pub fn parse_poll_response(body: &Value) -> PollResult {
    let data = &body["data"];
    let target = data["testInfo"]["url"]
        .as_str()
        .or_else(|| data["url"].as_str())
        .unwrap_or_default()
        .to_string();

    match status_code(body) {
        Some(100..=199) => PollResult::Pending { target },
        Some(200) => match parse_completed(data, target) {
            Ok(test) => PollResult::Completed(test),
            Err(reason) => PollResult::Malformed { reason },
        },
        Some(code) => PollResult::Malformed {
            reason: format!("service status {}: {}", code, status_text(body)),
        },
        None => PollResult::Malformed {
            reason: "response has no statusCode".into(),
        },
    }
}

fn parse_completed(data: &Value, target: String) -> Result<CompletedTest, String> {
    let first_view = &data["median"]["firstView"];
    if !first_view.is_object() {
        return Err("missing median.firstView".into());
    }

    let mut metrics = [0.0; METRIC_COUNT];
    for (slot, field) in metrics.iter_mut().zip(METRIC_SCHEMA.iter()) {
        *slot = field
            .sources
            .iter()
            .find_map(|name| first_view[*name].as_f64())
            .ok_or_else(|| format!("missing metric '{}'", field.sources[0]))?;
    }

    let completed_at = data["completed"]
        .as_i64()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or("missing completion timestamp")?;

    let report_url = data["summary"]
        .as_str()
        .ok_or("missing report link")?
        .to_string();

    Ok(CompletedTest {
        target,
        completed_at,
        metrics,
        report_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = "https://wpt.example";

    fn first_view() -> Value {
        json!({
            "requestsFull": 5, "bytesIn": 1000, "SpeedIndex": 100,
            "firstPaint": 50, "visualComplete": 200, "fullyLoaded": 900,
            "image_total": 10, "image_savings": 2, "gzip_savings": 1
        })
    }

    #[test]
    fn test_submit_accepted_uses_json_url() {
        let body = json!({
            "statusCode": 200,
            "data": { "testId": "260301_AB_1", "jsonUrl": "https://wpt.example/jsonResult.php?test=260301_AB_1" }
        });
        assert_eq!(
            parse_submit_response(&body, BASE),
            SubmitResult::Accepted { handle: "https://wpt.example/jsonResult.php?test=260301_AB_1".into() }
        );
    }

    #[test]
    fn test_submit_accepted_falls_back_to_test_id() {
        let body = json!({ "statusCode": 200, "data": { "testId": "T1" } });
        assert_eq!(
            parse_submit_response(&body, BASE),
            SubmitResult::Accepted { handle: "https://wpt.example/jsonResult.php?test=T1".into() }
        );
    }

    #[test]
    fn test_submit_rejected_carries_status() {
        let body = json!({ "statusCode": 400, "statusText": "Invalid API Key" });
        assert_eq!(
            parse_submit_response(&body, BASE),
            SubmitResult::Rejected { status: 400, message: "Invalid API Key".into() }
        );
    }

    #[test]
    fn test_poll_pending_keeps_target() {
        let body = json!({ "statusCode": 101, "statusText": "Test Pending", "data": { "testInfo": { "url": "https://a.example" } } });
        assert_eq!(parse_poll_response(&body), PollResult::Pending { target: "https://a.example".into() });
    }

    #[test]
    fn test_poll_completed_extracts_schema_in_order() {
        let body = json!({
            "statusCode": 200,
            "data": {
                "url": "https://a.example",
                "completed": 1772366400,
                "summary": "https://wpt.example/results.php?test=T1",
                "median": { "firstView": first_view() }
            }
        });
        let PollResult::Completed(test) = parse_poll_response(&body) else {
            panic!("expected completion");
        };
        assert_eq!(test.metrics, [5.0, 1000.0, 100.0, 50.0, 200.0, 900.0, 10.0, 2.0, 1.0]);
        assert_eq!(test.target, "https://a.example");
        assert_eq!(test.report_url, "https://wpt.example/results.php?test=T1");
        assert_eq!(test.completed_at.timestamp(), 1772366400);
    }

    #[test]
    fn test_poll_completed_missing_metric_is_malformed() {
        let mut fv = first_view();
        fv.as_object_mut().unwrap().remove("SpeedIndex");
        let body = json!({
            "statusCode": 200,
            "data": { "completed": 1, "summary": "x", "median": { "firstView": fv } }
        });
        assert_eq!(
            parse_poll_response(&body),
            PollResult::Malformed { reason: "missing metric 'SpeedIndex'".into() }
        );
    }

    #[test]
    fn test_poll_service_error_is_malformed() {
        let body = json!({ "statusCode": 400, "statusText": "Test not found" });
        assert!(matches!(
            parse_poll_response(&body),
            PollResult::Malformed { reason } if reason.contains("Test not found")
        ));
        assert!(matches!(parse_poll_response(&json!({})), PollResult::Malformed { .. }));
    }
}
