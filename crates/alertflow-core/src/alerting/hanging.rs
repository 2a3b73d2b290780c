//! Hanging request detection
//!
//! Every started request is tracked in a [`TtlCache`] whose TTL outlives the
//! alerting threshold by [`HANGING_ALERT_BUFFER`]. A sweep looks at the oldest
//! tracked requests, drops the ones the status store reports as finished and
//! raises one alert for each request still running past the threshold. An
//! alerted request is removed right away so the next sweep cannot alert it
//! again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::SharedSettings;
use crate::db::RequestStatusStore;
use crate::models::{AlertType, RequestStatus, Severity, TrackedRequest};

use super::router::AlertSink;

/// Extra lifetime of a tracked request beyond the alerting threshold
pub const HANGING_ALERT_BUFFER: Duration = Duration::from_secs(60);

/// Upper bound on requests inspected per sweep
pub const MAX_OLDEST_HANGING_REQUESTS_TO_CHECK: usize = 20;

#[derive(Clone)]
struct Tracked {
    request: TrackedRequest,
    started_at: Instant,
}

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tracked requests inspected
    pub checked: usize,
    /// Requests found finished and dropped
    pub completed: usize,
    /// Hanging alerts raised
    pub alerted: usize,
}

/// Watches in-flight requests for ones that never finish
pub struct HangingRequestMonitor {
    cache: TtlCache<String, Tracked>,
    status: Arc<dyn RequestStatusStore>,
    sink: Arc<dyn AlertSink>,
    settings: SharedSettings,
    started: AtomicBool,
}

impl HangingRequestMonitor {
    /// Create a monitor
    pub fn new(
        status: Arc<dyn RequestStatusStore>,
        sink: Arc<dyn AlertSink>,
        settings: SharedSettings,
    ) -> Self {
        let ttl = settings.current().alerting_threshold + HANGING_ALERT_BUFFER;
        Self {
            cache: TtlCache::new(ttl),
            status,
            sink,
            settings,
            started: AtomicBool::new(false),
        }
    }

    /// Start tracking a request. Requests without an id are ignored.
    pub fn track_start(&self, request: TrackedRequest) {
        if request.request_id.is_empty() {
            debug!("Ignoring request without id for hanging check");
            return;
        }

        let ttl = self.settings.current().alerting_threshold + HANGING_ALERT_BUFFER;
        let key = request.request_id.clone();
        self.cache.set(
            key,
            Tracked {
                request,
                started_at: Instant::now(),
            },
            ttl,
        );
    }

    /// Number of requests currently tracked
    pub fn tracked(&self) -> usize {
        self.cache.len()
    }

    /// Inspect the oldest tracked requests once
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let threshold = self.settings.current().alerting_threshold;

        for request_id in self.cache.oldest_n_keys(MAX_OLDEST_HANGING_REQUESTS_TO_CHECK) {
            let Some(tracked) = self.cache.get(&request_id) else {
                continue;
            };

            // Oldest first: everything after this one is younger still
            if tracked.started_at.elapsed() < threshold {
                break;
            }
            report.checked += 1;

            let status = match self.status.get_status(&request_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Request status lookup failed");
                    RequestStatus::NotFound
                }
            };

            if status.is_completed() {
                self.cache.remove(&request_id);
                report.completed += 1;
                continue;
            }

            // Remove before sending so an overlapping sweep cannot pick it up
            if self.cache.remove(&request_id).is_none() {
                continue;
            }
            self.send_hanging_alert(&tracked.request, threshold).await;
            report.alerted += 1;
        }

        if report.checked > 0 {
            debug!(
                checked = report.checked,
                completed = report.completed,
                alerted = report.alerted,
                "Hanging request sweep finished"
            );
        }
        report
    }

    async fn send_hanging_alert(&self, request: &TrackedRequest, threshold: Duration) {
        let message = hanging_message(request, threshold);
        self.sink
            .send_alert(
                &message,
                Severity::Medium,
                AlertType::LlmRequestsHanging,
                &request.alerting_metadata,
            )
            .await;
    }

    /// Start the sweep loop. A second call is a no-op and returns `None`.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let monitor = Arc::clone(self);
        Some(tokio::spawn(async move {
            monitor.run(shutdown).await;
        }))
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!("Hanging request monitor started");

        loop {
            debug!("Checking for hanging requests");
            self.sweep().await;

            let interval = (self.settings.current().alerting_threshold / 2).max(Duration::from_secs(1));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Hanging request monitor stopped");
    }
}

fn display_or_none(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("None")
}

/// Alert body for a hanging request
pub fn hanging_message(request: &TrackedRequest, threshold: Duration) -> String {
    format!(
        "**Requests are hanging** - `{}s+` request time\n\n\
         **Request Model:** `{}`\n\
         **API Base:** `{}`\n\
         **Key Alias:** `{}`\n\
         **Team Alias:** `{}`",
        threshold.as_secs_f64(),
        request.model,
        display_or_none(&request.api_base),
        display_or_none(&request.key_alias),
        display_or_none(&request.team_alias),
    )
}
