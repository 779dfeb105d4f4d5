//! Notification sink: best-effort webhook delivery across the five
//! pluggable channels named in spec §6. A delivery failure here never
//! blocks processing — callers log and move on.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationChannel {
    BatchManifest,
    QaStructural,
    QaContent,
    QaDomain,
    BatchReport,
}

impl NotificationChannel {
    pub fn slug(&self) -> &'static str {
        match self {
            NotificationChannel::BatchManifest => "batch_manifest",
            NotificationChannel::QaStructural => "qa_structural",
            NotificationChannel::QaContent => "qa_content",
            NotificationChannel::QaDomain => "qa_domain",
            NotificationChannel::BatchReport => "batch_report",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("http error delivering to channel '{0}': {1}")]
    Http(String, String),
}

/// Best-effort webhook delivery. Implementations must never propagate a
/// delivery failure as a reason to fail the task or process that triggered
/// the notification.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, channel: NotificationChannel, payload: serde_json::Value) -> Result<(), NotificationError>;
}

pub struct WebhookNotificationSink {
    client: reqwest::Client,
    webhook_urls: std::collections::HashMap<&'static str, String>,
}

impl WebhookNotificationSink {
    pub fn new(webhook_urls: std::collections::HashMap<&'static str, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_urls,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, channel: NotificationChannel, payload: serde_json::Value) -> Result<(), NotificationError> {
        let Some(url) = self.webhook_urls.get(channel.slug()) else {
            return Ok(());
        };
        match self.client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(NotificationError::Http(channel.slug().to_string(), format!("status {}", resp.status()))),
            Err(e) => Err(NotificationError::Http(channel.slug().to_string(), e.to_string())),
        }
    }
}

/// Fire-and-forget dispatch helper: logs and swallows delivery failures so
/// callers never need to handle a `Result`.
pub async fn notify_best_effort(
    sink: &dyn NotificationSink,
    channel: NotificationChannel,
    payload: impl Serialize + Send,
) {
    let payload = match serde_json::to_value(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(channel = channel.slug(), error = %e, "failed to serialize notification payload");
            return;
        }
    };
    if let Err(e) = sink.notify(channel, payload).await {
        tracing::warn!(channel = channel.slug(), error = %e, "notification delivery failed, continuing");
    }
}

#[derive(Default)]
pub struct MockNotificationSink {
    delivered: Mutex<Vec<(NotificationChannel, serde_json::Value)>>,
    fail_channel: Mutex<Option<NotificationChannel>>,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_channel(&self, channel: NotificationChannel) {
        *self.fail_channel.lock().unwrap() = Some(channel);
    }

    pub fn delivered(&self) -> Vec<(NotificationChannel, serde_json::Value)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn notify(&self, channel: NotificationChannel, payload: serde_json::Value) -> Result<(), NotificationError> {
        if self.fail_channel.lock().unwrap().as_ref() == Some(&channel) {
            return Err(NotificationError::Http(channel.slug().to_string(), "forced failure".to_string()));
        }
        self.delivered.lock().unwrap().push((channel, payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_delivered_notifications() {
        let sink = MockNotificationSink::new();
        notify_best_effort(&sink, NotificationChannel::QaStructural, serde_json::json!({"ok": true})).await;
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, NotificationChannel::QaStructural);
    }

    #[tokio::test]
    async fn best_effort_swallows_delivery_failure() {
        let sink = MockNotificationSink::new();
        sink.fail_channel(NotificationChannel::BatchReport);
        // Must not panic even though delivery fails.
        notify_best_effort(&sink, NotificationChannel::BatchReport, serde_json::json!({})).await;
        assert!(sink.delivered().is_empty());
    }

    #[test]
    fn channel_slugs_match_spec_names() {
        assert_eq!(NotificationChannel::BatchManifest.slug(), "batch_manifest");
        assert_eq!(NotificationChannel::QaStructural.slug(), "qa_structural");
        assert_eq!(NotificationChannel::QaContent.slug(), "qa_content");
        assert_eq!(NotificationChannel::QaDomain.slug(), "qa_domain");
        assert_eq!(NotificationChannel::BatchReport.slug(), "batch_report");
    }
}
