//! Alert batching and delivery
//!
//! Producers hand alerts to the [`AlertRouter`], which resolves webhooks and
//! feeds the [`BatchQueue`]. Flushes squash duplicates and the [`Dispatcher`]
//! posts one message per group. Hanging requests, outages and usage reports
//! are detected by background components that feed the same router.

mod dispatcher;
mod engine;
mod hanging;
mod outage;
mod queue;
mod reports;
mod router;
mod squash;

pub use dispatcher::{sign, AlertDelivery, DeliveryOutcome, Dispatcher, HttpClient, HttpResponse, ReqwestHttpClient};
pub use engine::{AlertEvent, AlertObserver, AlertingEngine, AlertingUpdate, EngineBuilder, DEFAULT_HTTP_TIMEOUT};
pub use hanging::{HangingRequestMonitor, SweepReport, HANGING_ALERT_BUFFER, MAX_OLDEST_HANGING_REQUESTS_TO_CHECK};
pub use outage::{OutageLevel, OutageTracker};
pub use queue::{BatchQueue, QueueStats};
pub use reports::{ModelRegistry, ReportScheduler, SpendReportSource, StaticModelRegistry, DAILY_REPORT_SENT_KEY};
pub use router::{card_title, AlertRouter, AlertSink};
pub use squash::squash;
