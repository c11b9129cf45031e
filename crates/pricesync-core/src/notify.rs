//! Outbound run summaries.
//!
//! A Slack incoming webhook when one is configured, otherwise a structured
//! log line. Delivery failures are logged by [`notify_run`] and never change
//! the run result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::orchestrator::{RunOutcome, SyncRunResult};

/// Errors shown in a notification before truncating.
const MAX_LISTED_ERRORS: usize = 5;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, result: &SyncRunResult) -> Result<()>;

    fn kind(&self) -> &'static str;
}

/// Send `result` unless it is a contention result. Never fails.
pub async fn notify_run(notifier: &dyn Notifier, result: &SyncRunResult) {
    if result.outcome == RunOutcome::Contention {
        return;
    }
    if let Err(e) = notifier.notify(result).await {
        warn!(
            line = result.line_id,
            correlation_id = %result.correlation_id,
            notifier = notifier.kind(),
            error = %e,
            "run summary delivery failed"
        );
    }
}

// ---------------------------------------------------------------------------
// Message body
// ---------------------------------------------------------------------------

/// Multi-line human-readable detail for one run.
pub fn render_detail(result: &SyncRunResult) -> String {
    let mut lines = vec![
        format!("Line:        {}", result.line_id),
        format!("Outcome:     {}", result.outcome.as_str()),
        format!(
            "Attempted:   {} of {} discovered ({} eligible)",
            result.attempted, result.discovered, result.eligible_total
        ),
        format!("Succeeded:   {}", result.succeeded),
        format!("Skipped:     {}", result.skipped),
        format!("Failed:      {}", result.failed),
        format!("Deferred:    {}", result.deferred),
        format!("Success:     {:.1}%", result.success_rate()),
        format!("Duration:    {:.1}s", result.elapsed().as_secs_f64()),
        format!("Correlation: {}", result.correlation_id),
    ];
    if !result.errors.is_empty() {
        lines.push(String::new());
        lines.push("Errors:".to_string());
        for e in result.errors.iter().take(MAX_LISTED_ERRORS) {
            lines.push(format!("  - {e}"));
        }
        let rest = result.errors.len().saturating_sub(MAX_LISTED_ERRORS);
        if rest > 0 {
            lines.push(format!("  ... and {rest} more"));
        }
    }
    lines.join("\n")
}

/// Block-kit payload: header, summary section, divider, fenced detail,
/// context timestamp.
pub fn slack_payload(result: &SyncRunResult, channel_label: Option<&str>, now: DateTime<Utc>) -> Value {
    let icon = match result.outcome {
        RunOutcome::Completed if result.failed == 0 => ":white_check_mark:",
        RunOutcome::Completed => ":warning:",
        RunOutcome::Contention | RunOutcome::Fatal | RunOutcome::Interrupted => ":x:",
    };
    let title = format!("Pricing sync: line {} {}", result.line_id, result.outcome.as_str());
    let mut headline = format!(
        "{icon} *{}* of *{}* items priced ({:.1}%)",
        result.succeeded,
        result.attempted,
        result.success_rate()
    );
    if let Some(label) = channel_label {
        headline.push_str(&format!("\nEnvironment: {label}"));
    }

    json!({
        "text": title,
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": title }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": headline }
            },
            { "type": "divider" },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("```{}```", render_detail(result)) }
            },
            {
                "type": "context",
                "elements": [
                    {
                        "type": "mrkdwn",
                        "text": format!("Sent at {}", now.format("%Y-%m-%d %H:%M:%S UTC"))
                    }
                ]
            }
        ]
    })
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    channel_label: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, channel_label: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            channel_label,
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, result: &SyncRunResult) -> Result<()> {
        let body = slack_payload(result, self.channel_label.as_deref(), Utc::now());
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Notify(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Notify(format!("slack returned {status}: {text}")));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "slack"
    }
}

/// Writes the summary to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, result: &SyncRunResult) -> Result<()> {
        info!(
            line = result.line_id,
            correlation_id = %result.correlation_id,
            summary = %result.summary(),
            "pricing sync run finished"
        );
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "log"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SyncRunResult;

    fn sample() -> SyncRunResult {
        let mut r = SyncRunResult::new("c-42", 22, Utc::now());
        r.eligible_total = 7;
        r.discovered = 7;
        r.attempted = 5;
        r.succeeded = 4;
        r.failed = 1;
        r.deferred = 2;
        r.errors = (0..7).map(|i| format!("item {i}: timed out")).collect();
        r
    }

    #[test]
    fn payload_has_block_kit_shape() {
        let v = slack_payload(&sample(), Some("staging"), Utc::now());
        let blocks = v["blocks"].as_array().unwrap();
        let kinds: Vec<&str> = blocks.iter().map(|b| b["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, ["header", "section", "divider", "section", "context"]);
        assert!(blocks[1]["text"]["text"].as_str().unwrap().contains("staging"));
        let detail = blocks[3]["text"]["text"].as_str().unwrap();
        assert!(detail.starts_with("```"));
        assert!(detail.contains("Deferred:    2"));
        assert!(detail.contains("... and 2 more"));
    }

    #[tokio::test]
    async fn slack_notifier_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(json!({"text": "Pricing sync: line 22 completed"})))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let notifier = SlackNotifier::new(format!("{}/hook", server.url()), None);
        notifier.notify(&sample()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn slack_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/hook")
            .with_status(403)
            .with_body("invalid_token")
            .create_async()
            .await;

        let notifier = SlackNotifier::new(format!("{}/hook", server.url()), None);
        let err = notifier.notify(&sample()).await.unwrap_err();
        assert!(err.to_string().contains("invalid_token"));
        // notify_run swallows it.
        notify_run(&notifier, &sample()).await;
    }

    #[tokio::test]
    async fn contention_is_not_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", "/hook").expect(0).create_async().await;
        let notifier = SlackNotifier::new(format!("{}/hook", server.url()), None);
        notify_run(&notifier, &SyncRunResult::contention("c-1", 22, Utc::now())).await;
        mock.assert_async().await;
    }
}
