//! Alerting engine
//!
//! Wires the queue, dispatcher, router, monitors and report scheduler
//! together, owns the background loops and implements [`AlertObserver`], the
//! single entry point used by the request-serving pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::{AlertingArgs, AlertingSettings, ResolvedConfig, SharedSettings, WebhookRoutes};
use crate::db::{
    MemoryRequestStatusStore, MemoryUsageStore, RedisPool, RedisRequestStatusStore, RedisUsageStore,
    RequestStatusStore, UsageStore,
};
use crate::error::Result;
use crate::models::{
    AlertType, BudgetEventKind, CallInfo, DeploymentMetrics, RequestOutcome, RequestStatus, Severity,
    TrackedRequest,
};

use super::dispatcher::{Dispatcher, HttpClient, ReqwestHttpClient};
use super::hanging::{HangingRequestMonitor, HANGING_ALERT_BUFFER};
use super::outage::OutageTracker;
use super::queue::{BatchQueue, QueueStats};
use super::reports::{ModelRegistry, ReportScheduler, SpendReportSource, StaticModelRegistry};
use super::router::{AlertRouter, AlertSink};

/// Default outbound HTTP timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Event raised by the surrounding system
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    /// A key, user, team or project crossed a budget
    Budget {
        /// Which budget was crossed
        kind: BudgetEventKind,
        /// Who crossed it
        call_info: CallInfo,
    },
    /// An upstream model call raised an exception
    LlmException {
        /// Requested model
        model: String,
        /// Error description
        message: String,
        /// Metadata forwarded to the alert
        alerting_metadata: Value,
    },
    /// The backing database raised an exception
    DbException {
        /// Error description
        message: String,
    },
    /// Free-form alert
    Custom {
        /// Markdown body
        message: String,
        /// Severity
        severity: Severity,
        /// Routing type
        alert_type: AlertType,
        /// Metadata forwarded to the alert
        alerting_metadata: Value,
    },
}

/// Hooks invoked by the request-serving pipeline
#[async_trait]
pub trait AlertObserver: Send + Sync {
    /// Something alert-worthy happened
    async fn on_alert_event(&self, event: AlertEvent);

    /// A request started
    async fn on_request_start(&self, request: TrackedRequest);

    /// A request finished, successfully or not
    async fn on_request_end(&self, outcome: RequestOutcome);
}

/// Partial reconfiguration applied with [`AlertingEngine::update`]
#[derive(Debug, Clone, Default)]
pub struct AlertingUpdate {
    /// Master switch
    pub enabled: Option<bool>,
    /// New slow/hanging threshold
    pub alerting_threshold: Option<Duration>,
    /// New enabled alert types
    pub alert_types: Option<Vec<AlertType>>,
    /// Routes merged over the current ones
    pub routes: Option<WebhookRoutes>,
    /// Replacement tunables
    pub args: Option<AlertingArgs>,
}

/// Builder for [`AlertingEngine`]
pub struct EngineBuilder {
    settings: AlertingSettings,
    signing_secret: Option<String>,
    http_timeout: Duration,
    http_client: Option<Arc<dyn HttpClient>>,
    usage_store: Option<Arc<dyn UsageStore>>,
    status_store: Option<Arc<dyn RequestStatusStore>>,
    model_registry: Option<Arc<dyn ModelRegistry>>,
    spend_source: Option<Arc<dyn SpendReportSource>>,
}

impl EngineBuilder {
    /// Start from alerting settings
    pub fn new(settings: AlertingSettings) -> Self {
        Self {
            settings,
            signing_secret: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            http_client: None,
            usage_store: None,
            status_store: None,
            model_registry: None,
            spend_source: None,
        }
    }

    /// Start from resolved configuration, using Redis stores when a URL is set
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let mut builder = Self::new(config.alerting.clone())
            .signing_secret(config.signing_secret.clone())
            .http_timeout(config.http_timeout)
            .model_registry(Arc::new(StaticModelRegistry::new(config.deployments.clone())));

        if let Some(url) = &config.redis_url {
            let pool = RedisPool::new(url, config.redis_max_connections)?;
            let status_ttl = status_ttl(&config.alerting);
            builder = builder
                .usage_store(Arc::new(RedisUsageStore::new(pool.clone())))
                .status_store(Arc::new(RedisRequestStatusStore::new(pool, status_ttl)));
        }

        Ok(builder)
    }

    /// Sign outgoing messages with this secret
    pub fn signing_secret(mut self, secret: Option<String>) -> Self {
        self.signing_secret = secret;
        self
    }

    /// Timeout of the default HTTP client
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Replace the HTTP transport
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Replace the usage store
    pub fn usage_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.usage_store = Some(store);
        self
    }

    /// Replace the request status store
    pub fn status_store(mut self, store: Arc<dyn RequestStatusStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    /// Replace the model registry
    pub fn model_registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.model_registry = Some(registry);
        self
    }

    /// Provide spend figures for spend reports
    pub fn spend_source(mut self, source: Arc<dyn SpendReportSource>) -> Self {
        self.spend_source = Some(source);
        self
    }

    /// Assemble the engine. No background loop is started.
    pub fn build(self) -> Result<AlertingEngine> {
        let http_client: Arc<dyn HttpClient> = match self.http_client {
            Some(client) => client,
            None => Arc::new(ReqwestHttpClient::new(self.http_timeout)?),
        };
        let status_ttl = status_ttl(&self.settings);
        let usage = self
            .usage_store
            .unwrap_or_else(|| Arc::new(MemoryUsageStore::new()));
        let status = self
            .status_store
            .unwrap_or_else(|| Arc::new(MemoryRequestStatusStore::new(status_ttl)));
        let registry = self
            .model_registry
            .unwrap_or_else(|| Arc::new(StaticModelRegistry::default()));

        let budget_ttl = self.settings.args.budget_alert_ttl();
        let settings = SharedSettings::new(self.settings);

        let dispatcher = Arc::new(Dispatcher::new(http_client, settings.clone(), self.signing_secret));
        let queue = Arc::new(BatchQueue::new(dispatcher, settings.clone()));
        let router = Arc::new(AlertRouter::new(Arc::clone(&queue), settings.clone()));
        let sink: Arc<dyn AlertSink> = router.clone();

        let monitor = Arc::new(HangingRequestMonitor::new(
            Arc::clone(&status),
            Arc::clone(&sink),
            settings.clone(),
        ));
        let reports = Arc::new(ReportScheduler::new(
            usage,
            registry,
            self.spend_source,
            Arc::clone(&sink),
            settings.clone(),
        ));
        let outage = OutageTracker::new(Arc::clone(&sink), settings.clone());

        Ok(AlertingEngine {
            settings,
            queue,
            router,
            monitor,
            reports,
            outage,
            status,
            sent_budget_alerts: TtlCache::new(budget_ttl),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// How long a request's final status is kept
fn status_ttl(settings: &AlertingSettings) -> Duration {
    settings.alerting_threshold * 2 + HANGING_ALERT_BUFFER
}

/// The alerting engine
pub struct AlertingEngine {
    settings: SharedSettings,
    queue: Arc<BatchQueue>,
    router: Arc<AlertRouter>,
    monitor: Arc<HangingRequestMonitor>,
    reports: Arc<ReportScheduler>,
    outage: OutageTracker,
    status: Arc<dyn RequestStatusStore>,
    sent_budget_alerts: TtlCache<String, ()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AlertingEngine {
    /// Builder with the given settings
    pub fn builder(settings: AlertingSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    /// Current settings
    pub fn settings(&self) -> Arc<AlertingSettings> {
        self.settings.current()
    }

    /// Report scheduler, for on-demand spend reports
    pub fn reports(&self) -> &ReportScheduler {
        &self.reports
    }

    /// Hanging request monitor
    pub fn monitor(&self) -> &HangingRequestMonitor {
        &self.monitor
    }

    /// Queue statistics
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Start the flush, hanging-request and report loops. Idempotent.
    pub fn start(&self) {
        let started = [
            self.queue.start_periodic_flush(self.shutdown.clone()),
            self.monitor.start(self.shutdown.clone()),
            self.reports.start(self.shutdown.clone()),
        ];

        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.extend(started.into_iter().flatten());
        if tasks.len() > before {
            info!(loops = tasks.len() - before, "Alerting engine started");
        }
    }

    /// Apply a partial reconfiguration.
    ///
    /// Routes are merged over the existing table; every other field replaces
    /// the current value. Enabling alerting or replacing the tunables also
    /// starts the periodic flush if it is not running yet.
    pub fn update(&self, update: AlertingUpdate) {
        let starts_flush = update.enabled.is_some() || update.args.is_some();

        self.settings.update(|settings| {
            if let Some(enabled) = update.enabled {
                settings.enabled = enabled;
            }
            if let Some(threshold) = update.alerting_threshold {
                settings.alerting_threshold = threshold;
            }
            if let Some(alert_types) = update.alert_types {
                settings.alert_types = alert_types;
            }
            if let Some(routes) = update.routes {
                settings.routes.merge(routes);
            }
            if let Some(args) = update.args {
                settings.args = args;
            }
        });
        debug!("Alerting settings updated");

        if starts_flush {
            if let Some(handle) = self.queue.start_periodic_flush(self.shutdown.clone()) {
                self.tasks.lock().push(handle);
            }
        }
    }

    /// Queue an alert through the router
    pub async fn send_alert(
        &self,
        message: &str,
        severity: Severity,
        alert_type: AlertType,
        alerting_metadata: &Value,
    ) -> usize {
        self.router
            .send_alert(message, severity, alert_type, alerting_metadata)
            .await
    }

    /// Deliver everything queued so far
    pub async fn flush(&self) -> usize {
        self.queue.flush().await
    }

    /// Alert when a finished request took longer than the threshold
    pub async fn response_taking_too_long(&self, outcome: &RequestOutcome) -> bool {
        let settings = self.settings.current();
        if !settings.is_enabled(AlertType::LlmTooSlow) {
            return false;
        }

        let threshold = settings.alerting_threshold;
        if outcome.elapsed <= threshold {
            return false;
        }

        let elapsed = (outcome.elapsed.as_secs_f64() * 100.0).round() / 100.0;
        let mut message = format!(
            "**Responses are slow** - `{elapsed}s` response time > Alerting threshold: `{}s`\n\
             **Request Model:** `{}`\n\
             **API Base:** `{}`",
            threshold.as_secs_f64(),
            outcome.model,
            outcome.api_base.as_deref().unwrap_or("None"),
        );
        if let Some(alias) = &outcome.key_alias {
            message.push_str(&format!("\n**Key Alias:** `{alias}`"));
        }
        if let Some(team) = &outcome.team_alias {
            message.push_str(&format!("\n**Team Alias:** `{team}`"));
        }

        self.send_alert(&message, Severity::Low, AlertType::LlmTooSlow, &outcome.alerting_metadata)
            .await
            > 0
    }

    /// Alert on a budget event, at most once per subject within `budget_alert_ttl`
    pub async fn budget_alert(&self, kind: BudgetEventKind, call_info: &CallInfo) -> bool {
        let settings = self.settings.current();
        if !settings.is_enabled(AlertType::BudgetAlerts) {
            return false;
        }

        let subject = call_info
            .token
            .as_deref()
            .or(call_info.user_id.as_deref())
            .or(call_info.team_id.as_deref())
            .or(call_info.key_alias.as_deref())
            .unwrap_or_default();
        let dedup_key = format!("{kind:?}:{subject}");
        if self.sent_budget_alerts.get(&dedup_key).is_some() {
            debug!(key = %dedup_key, "Budget alert already sent");
            return false;
        }

        let message = format!("**{}**\n\n{}", kind.event_message(), call_info.to_markdown());
        let queued = self
            .send_alert(&message, Severity::High, AlertType::BudgetAlerts, &Value::Null)
            .await;
        if queued == 0 {
            return false;
        }

        self.sent_budget_alerts
            .set(dedup_key, (), settings.args.budget_alert_ttl());
        true
    }

    /// Stop every loop and deliver what is still queued
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Alerting loop ended abnormally");
            }
        }

        let delivered = self.queue.flush().await;
        info!(groups = delivered, "Alerting engine stopped");
    }
}

#[async_trait]
impl AlertObserver for AlertingEngine {
    async fn on_alert_event(&self, event: AlertEvent) {
        match event {
            AlertEvent::Budget { kind, call_info } => {
                self.budget_alert(kind, &call_info).await;
            }
            AlertEvent::LlmException {
                model,
                message,
                alerting_metadata,
            } => {
                let body = format!("**LLM API call failed** - `{model}`\n\n{message}");
                self.send_alert(&body, Severity::High, AlertType::LlmExceptions, &alerting_metadata)
                    .await;
            }
            AlertEvent::DbException { message } => {
                let body = format!("**DB read/write call failed**\n\n{message}");
                self.send_alert(&body, Severity::High, AlertType::DbExceptions, &Value::Null)
                    .await;
            }
            AlertEvent::Custom {
                message,
                severity,
                alert_type,
                alerting_metadata,
            } => {
                self.send_alert(&message, severity, alert_type, &alerting_metadata)
                    .await;
            }
        }
    }

    async fn on_request_start(&self, request: TrackedRequest) {
        if self.settings.current().is_enabled(AlertType::LlmRequestsHanging) {
            self.monitor.track_start(request);
        }
    }

    async fn on_request_end(&self, outcome: RequestOutcome) {
        let status = if outcome.success {
            RequestStatus::Success
        } else {
            RequestStatus::Failure
        };
        if let Err(e) = self.status.set_status(&outcome.request_id, status).await {
            warn!(request_id = %outcome.request_id, error = %e, "Failed to record request status");
        }

        if self.settings.current().is_enabled(AlertType::DailyReports) {
            let metrics = DeploymentMetrics {
                id: outcome.deployment_id.clone(),
                failed_request: !outcome.success,
                latency_per_output_token: outcome.success.then(|| outcome.latency_per_output_token()),
                updated_at: Utc::now(),
            };
            self.reports.record_deployment_metrics(&metrics).await;
        }

        if outcome.success {
            self.response_taking_too_long(&outcome).await;
        } else {
            self.outage.record_failure(&outcome).await;
        }
    }
}
