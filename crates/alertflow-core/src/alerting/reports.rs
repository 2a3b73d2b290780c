//! Scheduled usage and spend reports
//!
//! Request outcomes feed per-deployment counters in the [`UsageStore`]. A
//! jittered loop checks whether the daily deployment report is due; the
//! last send time lives in the store so several instances sharing Redis
//! send roughly one report per period. Spend reports are sent on demand.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SharedSettings;
use crate::db::UsageStore;
use crate::error::{Error, Result};
use crate::models::{AlertType, DeploymentInfo, DeploymentMetrics, Severity, SpendReport, UsageCounter};

use super::router::AlertSink;

/// Store key holding the unix time of the last daily report
pub const DAILY_REPORT_SENT_KEY: &str = "daily_metrics_report_sent";

/// Number of deployments listed per daily report section
const TOP_DEPLOYMENTS: usize = 5;

/// Maximum deviation applied to the report check interval
const REPORT_JITTER_SECS: u64 = 3;

/// Deployment lookup used to name deployments in reports
pub trait ModelRegistry: Send + Sync {
    /// Ids of every known deployment
    fn model_ids(&self) -> Vec<String>;

    /// Details of one deployment
    fn deployment(&self, id: &str) -> Option<DeploymentInfo>;
}

/// [`ModelRegistry`] over a fixed deployment list
#[derive(Debug, Clone, Default)]
pub struct StaticModelRegistry {
    deployments: Vec<DeploymentInfo>,
}

impl StaticModelRegistry {
    /// Create a registry
    pub fn new(deployments: Vec<DeploymentInfo>) -> Self {
        Self { deployments }
    }
}

impl ModelRegistry for StaticModelRegistry {
    fn model_ids(&self) -> Vec<String> {
        self.deployments.iter().map(|d| d.id.clone()).collect()
    }

    fn deployment(&self, id: &str) -> Option<DeploymentInfo> {
        self.deployments.iter().find(|d| d.id == id).cloned()
    }
}

/// Source of spend figures for spend reports
#[async_trait]
pub trait SpendReportSource: Send + Sync {
    /// Spend between two dates, inclusive. `None` when no data is available.
    async fn spend_report(&self, start: NaiveDate, end: NaiveDate) -> Result<Option<SpendReport>>;
}

/// Builds and sends the periodic reports
pub struct ReportScheduler {
    usage: Arc<dyn UsageStore>,
    registry: Arc<dyn ModelRegistry>,
    spend: Option<Arc<dyn SpendReportSource>>,
    sink: Arc<dyn AlertSink>,
    settings: SharedSettings,
    started: AtomicBool,
}

impl ReportScheduler {
    /// Create a scheduler
    pub fn new(
        usage: Arc<dyn UsageStore>,
        registry: Arc<dyn ModelRegistry>,
        spend: Option<Arc<dyn SpendReportSource>>,
        sink: Arc<dyn AlertSink>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            usage,
            registry,
            spend,
            sink,
            settings,
            started: AtomicBool::new(false),
        }
    }

    /// Add one request's usage to the deployment counters.
    ///
    /// Returns the number of counters updated. Store errors are logged and
    /// reported as zero.
    pub async fn record_deployment_metrics(&self, metrics: &DeploymentMetrics) -> usize {
        if metrics.id.is_empty() {
            return 0;
        }

        let mut updated = 0;
        if metrics.failed_request {
            match self
                .usage
                .increment(&UsageCounter::FailedRequests.key(&metrics.id), 1.0)
                .await
            {
                Ok(_) => updated += 1,
                Err(e) => {
                    error!(deployment_id = %metrics.id, error = %e, "Failed to record failed request");
                    return 0;
                }
            }
        }

        if let Some(latency) = metrics.latency_per_output_token {
            match self
                .usage
                .increment(&UsageCounter::Latency.key(&metrics.id), latency)
                .await
            {
                Ok(_) => updated += 1,
                Err(e) => {
                    error!(deployment_id = %metrics.id, error = %e, "Failed to record latency");
                    return 0;
                }
            }
        }

        updated
    }

    /// Send the daily deployment report.
    ///
    /// Returns `false` without sending when no deployment has any usage.
    pub async fn send_daily_report(&self) -> Result<bool> {
        let ids = self.registry.model_ids();
        if ids.is_empty() {
            return Ok(false);
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| UsageCounter::FailedRequests.key(id))
            .chain(ids.iter().map(|id| UsageCounter::Latency.key(id)))
            .collect();
        let values = self.usage.batch_get(&keys).await?;
        if values.len() != keys.len() {
            return Err(Error::store(format!(
                "usage store returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }

        if !values.iter().any(|v| v.is_some_and(|v| v > 0.0)) {
            debug!("No deployment usage recorded, skipping daily report");
            return Ok(false);
        }

        let (failed, latency) = values.split_at(ids.len());
        let message = self.daily_report_message(&ids, failed, latency);

        self.sink
            .send_alert(&message, Severity::Low, AlertType::DailyReports, &Value::Null)
            .await;
        Ok(true)
    }

    fn daily_report_message(&self, ids: &[String], failed: &[Option<f64>], latency: &[Option<f64>]) -> String {
        let mut message = String::from("**Daily Report Summary** 📈\n\n");

        message.push_str("**Top Deployments with Most Failed Requests:**\n");
        let top_failed = top_indices(failed, TOP_DEPLOYMENTS);
        if top_failed.is_empty() {
            message.push_str("- None\n");
        }
        for (rank, idx) in top_failed.iter().enumerate() {
            let (name, api_base) = self.describe(&ids[*idx]);
            let value = failed[*idx].unwrap_or_default();
            message.push_str(&format!("{}. `{name}`: {value} failures (`{api_base}`)\n", rank + 1));
        }

        message.push_str("\n**Top Slowest Deployments:**\n");
        let top_slowest = top_indices(latency, TOP_DEPLOYMENTS);
        if top_slowest.is_empty() {
            message.push_str("- None\n");
        }
        for (rank, idx) in top_slowest.iter().enumerate() {
            let (name, api_base) = self.describe(&ids[*idx]);
            let value = round_to(latency[*idx].unwrap_or_default(), 3);
            message.push_str(&format!("{}. `{name}`: {value}s/token (`{api_base}`)\n", rank + 1));
        }

        message
    }

    fn describe(&self, id: &str) -> (String, String) {
        match self.registry.deployment(id) {
            Some(info) => (info.model, info.api_base.unwrap_or_else(|| "None".to_string())),
            None => (String::new(), "None".to_string()),
        }
    }

    /// Send the daily report when the last one is older than the configured frequency
    pub async fn run_daily_report_check(&self) -> Result<bool> {
        let frequency = self.settings.current().args.daily_report_frequency();
        let now = Utc::now().timestamp() as f64;

        let last_sent = self.usage.get(DAILY_REPORT_SENT_KEY).await?;
        let due = match last_sent {
            None => true,
            Some(sent) => now - sent >= frequency.as_secs_f64(),
        };
        if !due {
            return Ok(false);
        }

        self.send_daily_report().await?;
        self.usage.set(DAILY_REPORT_SENT_KEY, now, None).await?;
        Ok(true)
    }

    /// Send a spend report covering the last `days` days
    pub async fn send_weekly_spend_report(&self, days: i64) -> Result<bool> {
        let today = Utc::now().date_naive();
        let start = today - ChronoDuration::days(days);
        self.send_spend_report(SpendReportKind::Range, start, today).await
    }

    /// Send a spend report covering the current calendar month
    pub async fn send_monthly_spend_report(&self) -> Result<bool> {
        let (first, last) = month_bounds(Utc::now().date_naive())?;
        self.send_spend_report(SpendReportKind::Monthly, first, last).await
    }

    async fn send_spend_report(&self, kind: SpendReportKind, start: NaiveDate, end: NaiveDate) -> Result<bool> {
        if !self.settings.current().is_enabled(AlertType::SpendReports) {
            return Ok(false);
        }
        let Some(source) = &self.spend else {
            debug!("No spend source configured, skipping spend report");
            return Ok(false);
        };
        let Some(report) = source.spend_report(start, end).await? else {
            return Ok(false);
        };

        let message = spend_report_message(kind, start, end, &report);
        self.sink
            .send_alert(&message, Severity::Low, AlertType::SpendReports, &Value::Null)
            .await;
        Ok(true)
    }

    /// Start the report check loop. A second call is a no-op and returns `None`.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let scheduler = Arc::clone(self);
        Some(tokio::spawn(async move {
            scheduler.run(shutdown).await;
        }))
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!("Report scheduler started");

        loop {
            let settings = self.settings.current();
            if settings.is_enabled(AlertType::DailyReports) {
                if let Err(e) = self.run_daily_report_check().await {
                    error!(error = %e, "Daily report check failed");
                }
            }

            let interval = jittered(settings.args.report_check_interval);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Report scheduler stopped");
    }
}

#[derive(Debug, Clone, Copy)]
enum SpendReportKind {
    Range,
    Monthly,
}

fn spend_report_message(kind: SpendReportKind, start: NaiveDate, end: NaiveDate, report: &SpendReport) -> String {
    let mut message = match kind {
        SpendReportKind::Range => format!("**💸 Spend Report ({start} to {end})**\n"),
        SpendReportKind::Monthly => format!("**📅 Monthly Spend Report ({start} to {end})**\n"),
    };

    if !report.per_team.is_empty() {
        message.push_str("\n**Team Spend:**\n");
        for team in &report.per_team {
            message.push_str(&format!(
                "- Team: `{}` | Spend: `${}`\n",
                team.team_alias,
                round_to(team.total_spend, 4)
            ));
        }
    }

    if matches!(kind, SpendReportKind::Range) && !report.per_tag.is_empty() {
        message.push_str("\n**Tag Spend:**\n");
        for tag in &report.per_tag {
            message.push_str(&format!(
                "- Tag: `{}` | Spend: `${}`\n",
                tag.tag,
                round_to(tag.total_spend, 4)
            ));
        }
    }

    message
}

/// First and last day of the month containing `date`
fn month_bounds(date: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
    let first = date
        .with_day(1)
        .ok_or_else(|| Error::internal(format!("no first day for {date}")))?;
    let next_month = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
    .ok_or_else(|| Error::internal(format!("no month after {date}")))?;

    Ok((first, next_month - ChronoDuration::days(1)))
}

/// Indices of the `n` largest positive values, largest first
fn top_indices(values: &[Option<f64>], n: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len())
        .filter(|&i| values[i].is_some_and(|v| v > 0.0))
        .collect();

    indices.sort_by(|&a, &b| {
        let (a, b) = (values[a].unwrap_or_default(), values[b].unwrap_or_default());
        b.partial_cmp(&a).unwrap_or(CmpOrdering::Equal)
    });
    indices.truncate(n);
    indices
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Check interval with up to three seconds of jitter either way
fn jittered(interval_secs: u64) -> Duration {
    let low = interval_secs.saturating_sub(REPORT_JITTER_SECS).max(1);
    let high = (interval_secs + REPORT_JITTER_SECS).max(low);
    Duration::from_secs(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::hanging::tests::RecordingSink;
    use crate::config::AlertingSettings;
    use crate::db::MemoryUsageStore;
    use crate::models::{TagSpend, TeamSpend};
    use pretty_assertions::assert_eq;

    struct FixedSpend(SpendReport);

    #[async_trait]
    impl SpendReportSource for FixedSpend {
        async fn spend_report(&self, _start: NaiveDate, _end: NaiveDate) -> Result<Option<SpendReport>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn deployment(id: &str) -> DeploymentInfo {
        DeploymentInfo {
            id: id.to_string(),
            model: format!("model-{id}"),
            api_base: Some(format!("https://{id}.example")),
        }
    }

    fn scheduler(
        ids: &[&str],
        spend: Option<Arc<dyn SpendReportSource>>,
    ) -> (ReportScheduler, Arc<MemoryUsageStore>, Arc<RecordingSink>) {
        let usage = Arc::new(MemoryUsageStore::new());
        let registry = Arc::new(StaticModelRegistry::new(ids.iter().map(|id| deployment(id)).collect()));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = ReportScheduler::new(
            usage.clone(),
            registry,
            spend,
            sink.clone(),
            SharedSettings::new(AlertingSettings::default()),
        );
        (scheduler, usage, sink)
    }

    fn metrics(id: &str, failed: bool, latency: Option<f64>) -> DeploymentMetrics {
        DeploymentMetrics {
            id: id.to_string(),
            failed_request: failed,
            latency_per_output_token: latency,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_top_indices_selects_five_largest_positive() {
        let values = vec![
            Some(3.0),
            None,
            Some(9.0),
            Some(0.0),
            Some(1.0),
            Some(7.0),
            Some(5.0),
            Some(2.0),
        ];
        assert_eq!(top_indices(&values, 5), vec![2, 5, 6, 0, 7]);
        assert!(top_indices(&[None, Some(0.0)], 5).is_empty());
    }

    #[test]
    fn test_month_bounds() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 17).unwrap();
        assert_eq!(
            month_bounds(date).unwrap(),
            (
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
            )
        );

        let december = NaiveDate::from_ymd_opt(2023, 12, 5).unwrap();
        assert_eq!(month_bounds(december).unwrap().1, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..100 {
            let secs = jittered(300).as_secs();
            assert!((297..=303).contains(&secs));
        }
        assert!(jittered(0).as_secs() >= 1);
    }

    #[tokio::test]
    async fn test_record_deployment_metrics() {
        let (scheduler, usage, _) = scheduler(&["d1"], None);

        assert_eq!(scheduler.record_deployment_metrics(&metrics("d1", true, None)).await, 1);
        assert_eq!(scheduler.record_deployment_metrics(&metrics("d1", false, Some(0.25))).await, 1);
        assert_eq!(scheduler.record_deployment_metrics(&metrics("", true, Some(1.0))).await, 0);

        assert_eq!(usage.get("d1:failed_requests").await.unwrap(), Some(1.0));
        assert_eq!(usage.get("d1:latency").await.unwrap(), Some(0.25));
    }

    #[tokio::test]
    async fn test_daily_report_skipped_without_usage() {
        let (scheduler, _, sink) = scheduler(&["d1", "d2"], None);

        assert!(!scheduler.send_daily_report().await.unwrap());
        assert!(sink.alerts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_daily_report_lists_top_five() {
        let ids = ["d1", "d2", "d3", "d4", "d5", "d6"];
        let (scheduler, usage, sink) = scheduler(&ids, None);

        for (i, id) in ids.iter().enumerate() {
            usage
                .increment(&UsageCounter::FailedRequests.key(id), (i + 1) as f64)
                .await
                .unwrap();
        }
        usage.increment("d2:latency", 0.12345).await.unwrap();

        assert!(scheduler.send_daily_report().await.unwrap());

        let reports = sink.of_type(AlertType::DailyReports);
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(report.starts_with("**Daily Report Summary** 📈"));
        assert!(report.contains("1. `model-d6`: 6 failures (`https://d6.example`)"));
        assert!(report.contains("5. `model-d2`: 2 failures (`https://d2.example`)"));
        assert!(!report.contains("`model-d1`: 1 failures"));
        assert!(report.contains("1. `model-d2`: 0.123s/token (`https://d2.example`)"));
    }

    #[tokio::test]
    async fn test_daily_report_check_respects_frequency() {
        let (scheduler, usage, sink) = scheduler(&["d1"], None);
        usage.increment("d1:failed_requests", 2.0).await.unwrap();

        assert!(scheduler.run_daily_report_check().await.unwrap());
        assert!(usage.get(DAILY_REPORT_SENT_KEY).await.unwrap().is_some());
        assert!(!scheduler.run_daily_report_check().await.unwrap());

        assert_eq!(sink.of_type(AlertType::DailyReports).len(), 1);
    }

    #[tokio::test]
    async fn test_weekly_spend_report() {
        let source = Arc::new(FixedSpend(SpendReport {
            per_team: vec![TeamSpend {
                team_alias: "core".to_string(),
                total_spend: 12.345678,
            }],
            per_tag: vec![TagSpend {
                tag: "batch".to_string(),
                total_spend: 1.5,
            }],
        }));
        let (scheduler, _, sink) = scheduler(&[], Some(source));

        assert!(scheduler.send_weekly_spend_report(7).await.unwrap());

        let reports = sink.of_type(AlertType::SpendReports);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("**💸 Spend Report ("));
        assert!(reports[0].contains("- Team: `core` | Spend: `$12.3457`"));
        assert!(reports[0].contains("- Tag: `batch` | Spend: `$1.5`"));
    }

    #[tokio::test]
    async fn test_monthly_spend_report_omits_tags() {
        let source = Arc::new(FixedSpend(SpendReport {
            per_team: vec![TeamSpend {
                team_alias: "core".to_string(),
                total_spend: 3.0,
            }],
            per_tag: vec![TagSpend {
                tag: "batch".to_string(),
                total_spend: 1.5,
            }],
        }));
        let (scheduler, _, sink) = scheduler(&[], Some(source));

        assert!(scheduler.send_monthly_spend_report().await.unwrap());

        let report = &sink.of_type(AlertType::SpendReports)[0];
        assert!(report.starts_with("**📅 Monthly Spend Report ("));
        assert!(!report.contains("Tag Spend"));
    }

    #[tokio::test]
    async fn test_spend_report_without_source_is_skipped() {
        let (scheduler, _, sink) = scheduler(&[], None);
        assert!(!scheduler.send_weekly_spend_report(7).await.unwrap());
        assert!(sink.alerts.lock().is_empty());
    }
}
