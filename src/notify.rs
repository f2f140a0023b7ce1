//! Alert egress for run-level problems an operator has to act on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::retry::{self, RetryAction, RetryPolicy};
use crate::types::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CredentialsExpired,
    CredentialsStale,
    CredentialsUnverified,
    RetryExhausted,
    StateConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub run_id: String,
    pub stage: Stage,
    pub kind: AlertKind,
    pub severity: Severity,
    pub summary: String,
    pub action_required: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Alert webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Alert webhook returned HTTP {0}")]
    HttpStatus(u16),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder(),
            Self::HttpStatus(status) => *status == 429 || *status >= 500,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError>;
}

/// Posts each alert as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            url: url.into(),
            retry,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        retry::retry_with_backoff(
            &self.retry,
            "publish alert",
            |e: &NotifyError| RetryAction::from_retryable(e.is_retryable()),
            || async {
                let response = self.client.post(&self.url).json(event).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(NotifyError::HttpStatus(status.as_u16()));
                }
                Ok::<(), NotifyError>(())
            },
        )
        .await
        .map_err(|e| match e.into_last() {
            Some(last) => last,
            None => NotifyError::HttpStatus(504),
        })?;
        tracing::debug!(kind = ?event.kind, "Alert published");
        Ok(())
    }
}

/// Fallback when no webhook is configured: the alert becomes a log event.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event.severity {
            Severity::Critical => tracing::error!(
                run_id = %event.run_id,
                stage = %event.stage,
                alert = %payload,
                "ALERT: {}",
                event.summary
            ),
            Severity::Warning => tracing::warn!(
                run_id = %event.run_id,
                stage = %event.stage,
                alert = %payload,
                "ALERT: {}",
                event.summary
            ),
        }
        Ok(())
    }
}
