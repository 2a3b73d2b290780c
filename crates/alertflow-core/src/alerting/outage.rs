//! Deployment outage detection
//!
//! Failed requests are counted per deployment inside a sliding window of
//! `outage_alert_ttl`. Each new error restarts the window. Crossing the minor
//! threshold raises one Medium alert, crossing the major threshold one High
//! alert; both reset once the window lapses.

use std::sync::Arc;

use tracing::debug;

use crate::cache::TtlCache;
use crate::config::SharedSettings;
use crate::models::{AlertType, RequestOutcome, Severity};

use super::router::AlertSink;

/// Status codes that never count towards an outage
const IGNORED_STATUS_CODES: [u16; 1] = [400];

/// Outage severity reached by a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutageLevel {
    /// Minor threshold crossed
    Minor,
    /// Major threshold crossed
    Major,
}

impl OutageLevel {
    fn headline(&self) -> &'static str {
        match self {
            OutageLevel::Minor => "Minor Service Outage",
            OutageLevel::Major => "Major Service Outage",
        }
    }

    fn severity(&self) -> Severity {
        match self {
            OutageLevel::Minor => Severity::Medium,
            OutageLevel::Major => Severity::High,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct OutageWindow {
    model: String,
    api_base: Option<String>,
    errors: Vec<Option<u16>>,
    minor_alert_sent: bool,
    major_alert_sent: bool,
}

/// Counts deployment errors and raises outage alerts
pub struct OutageTracker {
    windows: TtlCache<String, OutageWindow>,
    sink: Arc<dyn AlertSink>,
    settings: SharedSettings,
}

impl OutageTracker {
    /// Create a tracker
    pub fn new(sink: Arc<dyn AlertSink>, settings: SharedSettings) -> Self {
        let ttl = settings.current().args.outage_alert_ttl();
        Self {
            windows: TtlCache::new(ttl),
            sink,
            settings,
        }
    }

    /// Record a failed request; returns the level alerted, if any
    pub async fn record_failure(&self, outcome: &RequestOutcome) -> Option<OutageLevel> {
        let settings = self.settings.current();
        if !settings.is_enabled(AlertType::OutageAlerts) || outcome.deployment_id.is_empty() {
            return None;
        }
        if let Some(status) = outcome.error_status {
            if IGNORED_STATUS_CODES.contains(&status) {
                return None;
            }
        }

        let args = &settings.args;
        let mut level = None;

        let window = self.windows.upsert(
            outcome.deployment_id.clone(),
            args.outage_alert_ttl(),
            |current| {
                let mut window = current.unwrap_or_else(|| OutageWindow {
                    model: outcome.model.clone(),
                    api_base: outcome.api_base.clone(),
                    ..OutageWindow::default()
                });

                window.errors.push(outcome.error_status);
                let max = args.max_outage_alert_list_size.max(1);
                if window.errors.len() > max {
                    let excess = window.errors.len() - max;
                    window.errors.drain(..excess);
                }

                let count = window.errors.len();
                if count >= args.major_outage_alert_threshold && !window.major_alert_sent {
                    window.major_alert_sent = true;
                    window.minor_alert_sent = true;
                    level = Some(OutageLevel::Major);
                } else if count >= args.minor_outage_alert_threshold && !window.minor_alert_sent {
                    window.minor_alert_sent = true;
                    level = Some(OutageLevel::Minor);
                }
                window
            },
        );

        let level = level?;
        debug!(
            deployment_id = %outcome.deployment_id,
            errors = window.errors.len(),
            ?level,
            "Outage threshold crossed"
        );

        let message = outage_message(level, &window, args.outage_alert_ttl);
        self.sink
            .send_alert(&message, level.severity(), AlertType::OutageAlerts, &outcome.alerting_metadata)
            .await;
        Some(level)
    }

    /// Deployments with an open error window
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

fn outage_message(level: OutageLevel, window: &OutageWindow, window_secs: u64) -> String {
    let codes: Vec<String> = window
        .errors
        .iter()
        .map(|code| code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))
        .collect();

    format!(
        "**{}** 🚨\n\n**Model:** `{}`\n**API Base:** `{}`\n**Errors:** `{}` in the last `{}s`\n**Error Codes:** `{}`",
        level.headline(),
        window.model,
        window.api_base.as_deref().unwrap_or("None"),
        window.errors.len(),
        window_secs,
        codes.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::hanging::tests::RecordingSink;
    use crate::config::{AlertingArgs, AlertingSettings};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::advance;

    fn tracker(minor: usize, major: usize) -> (OutageTracker, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let settings = SharedSettings::new(AlertingSettings {
            args: AlertingArgs {
                outage_alert_ttl: 60,
                minor_outage_alert_threshold: minor,
                major_outage_alert_threshold: major,
                max_outage_alert_list_size: 10,
                ..AlertingArgs::default()
            },
            ..AlertingSettings::default()
        });
        (OutageTracker::new(sink.clone(), settings), sink)
    }

    fn failure(status: Option<u16>) -> RequestOutcome {
        RequestOutcome {
            request_id: "r".to_string(),
            deployment_id: "d1".to_string(),
            model: "gpt-4o".to_string(),
            api_base: Some("https://api.example".to_string()),
            key_alias: None,
            team_alias: None,
            elapsed: Duration::from_secs(1),
            completion_tokens: None,
            error_status: status,
            success: false,
            alerting_metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_minor_then_major_alert_once_each() {
        let (tracker, sink) = tracker(2, 4);

        let mut levels = Vec::new();
        for _ in 0..6 {
            levels.push(tracker.record_failure(&failure(Some(503))).await);
        }

        assert_eq!(
            levels,
            vec![
                None,
                Some(OutageLevel::Minor),
                None,
                Some(OutageLevel::Major),
                None,
                None
            ]
        );

        let alerts = sink.alerts.lock().clone();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].1, Severity::Medium);
        assert_eq!(alerts[1].1, Severity::High);
        assert!(alerts[1].2.starts_with("**Major Service Outage**"));
        assert!(alerts[1].2.contains("**Errors:** `4` in the last `60s`"));
        assert!(alerts[1].2.contains("**Error Codes:** `503, 503, 503, 503`"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_request_ignored() {
        let (tracker, sink) = tracker(1, 2);

        assert_eq!(tracker.record_failure(&failure(Some(400))).await, None);
        assert_eq!(tracker.tracked(), 0);
        assert!(sink.alerts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_lapses() {
        let (tracker, sink) = tracker(2, 10);

        tracker.record_failure(&failure(Some(500))).await;
        advance(Duration::from_secs(61)).await;
        assert_eq!(tracker.record_failure(&failure(Some(500))).await, None);

        assert_eq!(tracker.record_failure(&failure(None)).await, Some(OutageLevel::Minor));
        assert!(sink.alerts.lock()[0].2.contains("`500, unknown`"));
    }
}
