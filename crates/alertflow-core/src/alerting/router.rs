//! Alert producer API
//!
//! Turns a message into card payloads, one per resolved webhook, and hands
//! them to the batch queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::SharedSettings;
use crate::models::{AlertItem, AlertPayload, AlertType, CardContent, Severity};

use super::queue::BatchQueue;

/// Destination for formatted alerts.
///
/// Background monitors hold this instead of the whole engine.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Queue an alert for every endpoint routed to `alert_type`.
    ///
    /// Returns the number of queued items; zero when the type is disabled or
    /// no endpoint is configured.
    async fn send_alert(
        &self,
        message: &str,
        severity: Severity,
        alert_type: AlertType,
        alerting_metadata: &Value,
    ) -> usize;
}

/// [`AlertSink`] that resolves webhooks and feeds the [`BatchQueue`]
pub struct AlertRouter {
    queue: Arc<BatchQueue>,
    settings: SharedSettings,
}

impl AlertRouter {
    /// Create a router on top of a queue
    pub fn new(queue: Arc<BatchQueue>, settings: SharedSettings) -> Self {
        Self { queue, settings }
    }

    /// The queue alerts are fed into
    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }
}

/// Card title for an alert type, e.g. `LLM Gateway Budget Alerts Alert`
pub fn card_title(prefix: &str, alert_type: AlertType) -> String {
    let title = alert_type.title();
    if prefix.is_empty() {
        format!("{title} Alert")
    } else {
        format!("{prefix} {title} Alert")
    }
}

/// Append caller metadata as a markdown list
fn with_metadata(message: &str, metadata: &Value) -> String {
    let fields = match metadata.as_object() {
        Some(fields) if !fields.is_empty() => fields,
        _ => return message.to_string(),
    };

    let mut out = format!("{message}\n\n**Alerting Metadata:**");
    for (key, value) in fields {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!("\n- **{key}:** `{rendered}`"));
    }
    out
}

#[async_trait]
impl AlertSink for AlertRouter {
    async fn send_alert(
        &self,
        message: &str,
        severity: Severity,
        alert_type: AlertType,
        alerting_metadata: &Value,
    ) -> usize {
        let settings = self.settings.current();
        if !settings.is_enabled(alert_type) {
            debug!(%alert_type, "Alert type disabled, dropping alert");
            return 0;
        }

        let urls = settings
            .routes
            .resolve(alert_type, settings.default_webhook_url.as_deref());
        if urls.is_empty() {
            debug!(%alert_type, "No webhook configured, dropping alert");
            return 0;
        }

        let title = card_title(&settings.title_prefix, alert_type);
        let body = with_metadata(message, alerting_metadata);
        let payload = AlertPayload::Card {
            card: CardContent::markdown(&title, &body, severity),
        };

        let queued = urls.len();
        for url in urls {
            self.queue
                .enqueue(AlertItem::new(url, alert_type, payload.clone()))
                .await;
        }

        debug!(%alert_type, endpoints = queued, "Alert queued");
        queued
    }
}
