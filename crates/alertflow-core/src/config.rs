//! Configuration management for AlertFlow
//!
//! Raw configuration is loaded once from an optional TOML file plus
//! `ALERTFLOW__*` environment variables. [`Config::resolve`] then replaces
//! every `os.environ/NAME` secret reference with its value and produces an
//! immutable [`ResolvedConfig`]; nothing reads the environment after that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::models::{AlertType, DeploymentInfo};

/// Prefix marking a value that must be read from the environment
pub const SECRET_REFERENCE_PREFIX: &str = "os.environ/";

/// Environment variable consulted when no default webhook URL is configured
pub const DEFAULT_WEBHOOK_URL_ENV: &str = "FEISHU_WEBHOOK_URL";

/// Environment variable consulted when no signing secret is configured
pub const SIGNING_SECRET_ENV: &str = "FEISHU_SECRET";

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Alerting behaviour
    pub alerting: AlertingConfig,

    /// Webhook endpoints and signing
    pub webhooks: WebhookConfig,

    /// Redis configuration for the shared stores
    pub redis: RedisConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Deployments named in daily reports
    pub deployments: Vec<DeploymentInfo>,
}

/// Alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Master switch; when off no alert is ever queued
    pub enabled: bool,
    /// Seconds after which a response is slow and a request is hanging
    pub alerting_threshold_seconds: f64,
    /// Alert types that are emitted
    pub alert_types: Vec<AlertType>,
    /// Queue length that triggers an inline flush
    pub batch_size: usize,
    /// Seconds between periodic flushes
    pub flush_interval_seconds: u64,
    /// Report and outage tunables
    pub args: AlertingArgs,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alerting_threshold_seconds: 300.0,
            alert_types: AlertType::ALL.to_vec(),
            batch_size: 512,
            flush_interval_seconds: 5,
            args: AlertingArgs::default(),
        }
    }
}

/// Report and outage tunables, replaced as a whole on reconfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingArgs {
    /// Seconds between daily deployment reports
    pub daily_report_frequency: u64,
    /// Seconds between checks whether a report is due
    pub report_check_interval: u64,
    /// Seconds a budget alert is suppressed after firing
    pub budget_alert_ttl: u64,
    /// Seconds of the error window used for outage detection
    pub outage_alert_ttl: u64,
    /// Errors in the window that count as a minor outage
    pub minor_outage_alert_threshold: usize,
    /// Errors in the window that count as a major outage
    pub major_outage_alert_threshold: usize,
    /// Maximum errors remembered per deployment
    pub max_outage_alert_list_size: usize,
    /// Echo every delivered payload to the log
    pub log_to_console: bool,
}

impl Default for AlertingArgs {
    fn default() -> Self {
        Self {
            daily_report_frequency: 12 * 60 * 60,
            report_check_interval: 5 * 60,
            budget_alert_ttl: 24 * 60 * 60,
            outage_alert_ttl: 60,
            minor_outage_alert_threshold: 5,
            major_outage_alert_threshold: 10,
            max_outage_alert_list_size: 10,
            log_to_console: false,
        }
    }
}

impl AlertingArgs {
    /// Daily report frequency as a duration
    pub fn daily_report_frequency(&self) -> Duration {
        Duration::from_secs(self.daily_report_frequency)
    }

    /// Report check interval as a duration
    pub fn report_check_interval(&self) -> Duration {
        Duration::from_secs(self.report_check_interval)
    }

    /// Budget alert suppression window as a duration
    pub fn budget_alert_ttl(&self) -> Duration {
        Duration::from_secs(self.budget_alert_ttl)
    }

    /// Outage error window as a duration
    pub fn outage_alert_ttl(&self) -> Duration {
        Duration::from_secs(self.outage_alert_ttl)
    }
}

/// One webhook URL or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoints {
    /// A single URL
    One(String),
    /// Several URLs
    Many(Vec<String>),
}

impl Endpoints {
    fn into_vec(self) -> Vec<String> {
        match self {
            Endpoints::One(url) => vec![url],
            Endpoints::Many(urls) => urls,
        }
    }
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Fallback URL when no route matches
    pub default_webhook_url: Option<String>,
    /// Alert type (or `default`) to URL(s)
    pub alert_to_webhook_url: HashMap<String, Endpoints>,
    /// Secret used to sign outgoing messages
    pub signing_secret: Option<String>,
    /// Prefix of every card title
    pub title_prefix: String,
    /// HTTP timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_webhook_url: None,
            alert_to_webhook_url: HashMap::new(),
            signing_secret: None,
            title_prefix: "LLM Gateway".to_string(),
            timeout_seconds: 30,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL; in-memory stores are used when unset
    pub url: Option<String>,
    /// Maximum pooled connections
    pub max_connections: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Webhook routing table with resolved URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRoutes {
    by_type: HashMap<AlertType, Vec<String>>,
    default: Option<Vec<String>>,
}

impl WebhookRoutes {
    /// Route an alert type to URLs
    pub fn with_route(mut self, alert_type: AlertType, urls: Vec<String>) -> Self {
        self.by_type.insert(alert_type, urls);
        self
    }

    /// Set the `default` route
    pub fn with_default(mut self, urls: Vec<String>) -> Self {
        self.default = Some(urls);
        self
    }

    /// Resolve the URLs for an alert type.
    ///
    /// Order: the type's own route, then the `default` route, then the global
    /// fallback URL. An empty route counts as unset.
    pub fn resolve(&self, alert_type: AlertType, global_default: Option<&str>) -> Vec<String> {
        let routed = self
            .by_type
            .get(&alert_type)
            .filter(|urls| has_url(urls))
            .or_else(|| self.default.as_ref().filter(|urls| has_url(urls)));

        if let Some(urls) = routed {
            return urls.iter().filter(|u| !u.is_empty()).cloned().collect();
        }

        global_default
            .filter(|url| !url.is_empty())
            .map(|url| vec![url.to_string()])
            .unwrap_or_default()
    }

    /// Overlay routes from `other`; keys present in `other` win
    pub fn merge(&mut self, other: WebhookRoutes) {
        self.by_type.extend(other.by_type);
        if other.default.is_some() {
            self.default = other.default;
        }
    }

    /// Whether no route is configured
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.default.is_none()
    }

    /// Build the routing table, resolving secret references
    pub fn from_config<F>(raw: &HashMap<String, Endpoints>, lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut routes = WebhookRoutes::default();

        for (key, endpoints) in raw {
            let urls = endpoints
                .clone()
                .into_vec()
                .into_iter()
                .map(|url| resolve_secret(&url, lookup))
                .collect::<Result<Vec<_>>>()?;

            if key == "default" {
                routes.default = Some(urls);
            } else {
                let alert_type: AlertType = key
                    .parse()
                    .map_err(|_| Error::config(format!("unknown alert type in webhook routes: {key}")))?;
                routes.by_type.insert(alert_type, urls);
            }
        }

        Ok(routes)
    }
}

fn has_url(urls: &[String]) -> bool {
    urls.iter().any(|u| !u.is_empty())
}

/// Resolve a possibly secret-backed value.
///
/// Plain values pass through; `os.environ/NAME` must resolve or the whole
/// configuration is rejected.
pub fn resolve_secret<F>(value: &str, lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match value.strip_prefix(SECRET_REFERENCE_PREFIX) {
        Some(name) => lookup(name)
            .ok_or_else(|| Error::config(format!("Invalid webhook url value for: {value}. Variable {name} is not set"))),
        None => Ok(value.to_string()),
    }
}

impl Config {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("ALERTFLOW")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("alerting.alert_types")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.alerting.batch_size == 0 {
            return Err(Error::config("alerting.batch_size must be at least 1"));
        }
        if self.alerting.flush_interval_seconds == 0 {
            return Err(Error::config("alerting.flush_interval_seconds must be at least 1"));
        }
        let threshold = self.alerting.alerting_threshold_seconds;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(Error::config(
                "alerting.alerting_threshold_seconds must be a positive finite number",
            ));
        }
        Ok(())
    }

    /// Resolve secret references against the process environment
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve secret references with a custom lookup
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ResolvedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.validate()?;

        let routes = WebhookRoutes::from_config(&self.webhooks.alert_to_webhook_url, &lookup)?;

        let default_webhook_url = match &self.webhooks.default_webhook_url {
            Some(url) => Some(resolve_secret(url, &lookup)?),
            None => lookup(DEFAULT_WEBHOOK_URL_ENV),
        };

        let signing_secret = match &self.webhooks.signing_secret {
            Some(secret) => Some(resolve_secret(secret, &lookup)?),
            None => lookup(SIGNING_SECRET_ENV),
        }
        .filter(|s| !s.is_empty());

        let redis_url = self
            .redis
            .url
            .as_deref()
            .map(|url| resolve_secret(url, &lookup))
            .transpose()?;

        let alerting_threshold = Duration::try_from_secs_f64(self.alerting.alerting_threshold_seconds)
            .map_err(|e| Error::config(format!("alerting.alerting_threshold_seconds: {e}")))?;

        let alerting = AlertingSettings {
            enabled: self.alerting.enabled,
            alerting_threshold,
            alert_types: self.alerting.alert_types.clone(),
            batch_size: self.alerting.batch_size,
            flush_interval: Duration::from_secs(self.alerting.flush_interval_seconds),
            args: self.alerting.args.clone(),
            routes,
            default_webhook_url,
            title_prefix: self.webhooks.title_prefix.clone(),
        };

        Ok(ResolvedConfig {
            alerting,
            signing_secret,
            http_timeout: Duration::from_secs(self.webhooks.timeout_seconds),
            redis_url,
            redis_max_connections: self.redis.max_connections,
            logging: self.logging.clone(),
            deployments: self.deployments.clone(),
        })
    }
}

/// Live alerting settings; replaced as a whole on reconfiguration
#[derive(Debug, Clone, PartialEq)]
pub struct AlertingSettings {
    /// Master switch
    pub enabled: bool,
    /// Slow/hanging request threshold
    pub alerting_threshold: Duration,
    /// Alert types that are emitted
    pub alert_types: Vec<AlertType>,
    /// Queue length that triggers an inline flush
    pub batch_size: usize,
    /// Time between periodic flushes
    pub flush_interval: Duration,
    /// Report and outage tunables
    pub args: AlertingArgs,
    /// Webhook routing table
    pub routes: WebhookRoutes,
    /// Global fallback URL
    pub default_webhook_url: Option<String>,
    /// Prefix of every card title
    pub title_prefix: String,
}

impl Default for AlertingSettings {
    fn default() -> Self {
        let raw = AlertingConfig::default();
        Self {
            enabled: raw.enabled,
            alerting_threshold: Duration::from_secs_f64(raw.alerting_threshold_seconds),
            alert_types: raw.alert_types,
            batch_size: raw.batch_size,
            flush_interval: Duration::from_secs(raw.flush_interval_seconds),
            args: raw.args,
            routes: WebhookRoutes::default(),
            default_webhook_url: None,
            title_prefix: WebhookConfig::default().title_prefix,
        }
    }
}

impl AlertingSettings {
    /// Whether an alert type is enabled
    pub fn is_enabled(&self, alert_type: AlertType) -> bool {
        self.enabled && self.alert_types.contains(&alert_type)
    }
}

/// Shared handle to the current [`AlertingSettings`].
///
/// Readers take a cheap snapshot with [`SharedSettings::current`]; writers
/// swap in a whole new value. Background loops call `current` on every
/// iteration so reconfiguration is picked up without a restart.
#[derive(Debug, Clone)]
pub struct SharedSettings(Arc<RwLock<Arc<AlertingSettings>>>);

impl SharedSettings {
    /// Wrap initial settings
    pub fn new(settings: AlertingSettings) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(settings))))
    }

    /// Snapshot of the current settings
    pub fn current(&self) -> Arc<AlertingSettings> {
        self.0.read().clone()
    }

    /// Replace the settings wholesale
    pub fn replace(&self, settings: AlertingSettings) {
        *self.0.write() = Arc::new(settings);
    }

    /// Derive new settings from the current ones and swap them in
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AlertingSettings),
    {
        let mut guard = self.0.write();
        let mut next = AlertingSettings::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }
}

/// Configuration after secret resolution
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Initial alerting settings
    pub alerting: AlertingSettings,
    /// Webhook signing secret
    pub signing_secret: Option<String>,
    /// Outbound HTTP timeout
    pub http_timeout: Duration,
    /// Redis URL for shared stores
    pub redis_url: Option<String>,
    /// Maximum pooled Redis connections
    pub redis_max_connections: usize,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Deployments named in daily reports
    pub deployments: Vec<DeploymentInfo>,
}

impl ResolvedConfig {
    /// Printable summary with secrets and webhook paths redacted
    pub fn summary(&self) -> serde_json::Value {
        let routes: HashMap<String, Vec<String>> = AlertType::ALL
            .into_iter()
            .map(|t| {
                let urls = self
                    .alerting
                    .routes
                    .resolve(t, self.alerting.default_webhook_url.as_deref())
                    .iter()
                    .map(|url| redact_url(url))
                    .collect();
                (t.as_str().to_string(), urls)
            })
            .collect();

        serde_json::json!({
            "enabled": self.alerting.enabled,
            "alerting_threshold_seconds": self.alerting.alerting_threshold.as_secs_f64(),
            "alert_types": self.alerting.alert_types,
            "batch_size": self.alerting.batch_size,
            "flush_interval_seconds": self.alerting.flush_interval.as_secs(),
            "args": self.alerting.args,
            "routes": routes,
            "signing": if self.signing_secret.is_some() { "configured" } else { "disabled" },
            "redis": self.redis_url.is_some(),
            "deployments": self.deployments.len(),
        })
    }
}

/// Keep only scheme and host of a webhook URL; bot tokens live in the path
fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => match url.host_str() {
            Some(host) => format!("{}://{host}/***", url.scheme()),
            None => "***".to_string(),
        },
        Err(_) => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_route_for_type_wins() {
        let routes = WebhookRoutes::default()
            .with_route(AlertType::BudgetAlerts, urls(&["https://budget"]))
            .with_default(urls(&["https://default"]));

        assert_eq!(
            routes.resolve(AlertType::BudgetAlerts, Some("https://global")),
            urls(&["https://budget"])
        );
    }

    #[test]
    fn test_default_route_then_global_fallback() {
        let routes = WebhookRoutes::default().with_default(urls(&["https://d1", "https://d2"]));
        assert_eq!(
            routes.resolve(AlertType::LlmTooSlow, Some("https://global")),
            urls(&["https://d1", "https://d2"])
        );

        let empty = WebhookRoutes::default();
        assert_eq!(
            empty.resolve(AlertType::LlmTooSlow, Some("https://global")),
            urls(&["https://global"])
        );
        assert!(empty.resolve(AlertType::LlmTooSlow, None).is_empty());
    }

    #[test]
    fn test_empty_route_falls_through() {
        let routes = WebhookRoutes::default()
            .with_route(AlertType::LlmTooSlow, vec![])
            .with_default(urls(&["https://default"]));

        assert_eq!(
            routes.resolve(AlertType::LlmTooSlow, None),
            urls(&["https://default"])
        );
    }

    #[test]
    fn test_merge_overrides_existing_keys() {
        let mut routes = WebhookRoutes::default()
            .with_route(AlertType::LlmTooSlow, urls(&["https://old"]))
            .with_route(AlertType::BudgetAlerts, urls(&["https://budget"]));
        routes.merge(WebhookRoutes::default().with_route(AlertType::LlmTooSlow, urls(&["https://new"])));

        assert_eq!(routes.resolve(AlertType::LlmTooSlow, None), urls(&["https://new"]));
        assert_eq!(routes.resolve(AlertType::BudgetAlerts, None), urls(&["https://budget"]));
    }

    #[test]
    fn test_resolve_secret_references() {
        let mut config = Config::default();
        config.webhooks.alert_to_webhook_url.insert(
            "budget_alerts".to_string(),
            Endpoints::Many(urls(&["os.environ/HOOK_1", "https://plain"])),
        );
        config
            .webhooks
            .alert_to_webhook_url
            .insert("default".to_string(), Endpoints::One("os.environ/HOOK_2".to_string()));
        config.webhooks.signing_secret = Some("os.environ/SIGN".to_string());

        let resolved = config
            .resolve_with(env(&[
                ("HOOK_1", "https://hook-1"),
                ("HOOK_2", "https://hook-2"),
                ("SIGN", "s3cret"),
            ]))
            .unwrap();

        assert_eq!(
            resolved.alerting.routes.resolve(AlertType::BudgetAlerts, None),
            urls(&["https://hook-1", "https://plain"])
        );
        assert_eq!(
            resolved.alerting.routes.resolve(AlertType::DailyReports, None),
            urls(&["https://hook-2"])
        );
        assert_eq!(resolved.signing_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_unresolved_secret_is_fatal() {
        let mut config = Config::default();
        config
            .webhooks
            .alert_to_webhook_url
            .insert("llm_too_slow".to_string(), Endpoints::One("os.environ/MISSING".to_string()));

        let err = config.resolve_with(env(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_route_key_rejected() {
        let mut config = Config::default();
        config
            .webhooks
            .alert_to_webhook_url
            .insert("bogus".to_string(), Endpoints::One("https://x".to_string()));

        assert!(config.resolve_with(env(&[])).is_err());
    }

    #[test]
    fn test_env_fallbacks_for_default_url_and_secret() {
        let resolved = Config::default()
            .resolve_with(env(&[
                (DEFAULT_WEBHOOK_URL_ENV, "https://from-env"),
                (SIGNING_SECRET_ENV, ""),
            ]))
            .unwrap();

        assert_eq!(resolved.alerting.default_webhook_url.as_deref(), Some("https://from-env"));
        assert_eq!(resolved.signing_secret, None);
    }

    #[test]
    fn test_unbounded_threshold_is_config_error() {
        for threshold in [f64::INFINITY, f64::NAN, 1e30] {
            let mut config = Config::default();
            config.alerting.alerting_threshold_seconds = threshold;

            let err = config.resolve_with(env(&[])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "threshold {threshold}");
        }
    }

    #[test]
    fn test_summary_redacts_webhook_tokens() {
        let mut config = Config::default();
        config
            .webhooks
            .alert_to_webhook_url
            .insert("default".to_string(), Endpoints::One("os.environ/HOOK".to_string()));
        config.webhooks.signing_secret = Some("s3cret".to_string());

        let resolved = config
            .resolve_with(env(&[(
                "HOOK",
                "https://open.feishu.cn/open-apis/bot/v2/hook/SECRET-TOKEN",
            )]))
            .unwrap();
        let summary = resolved.summary();
        let printed = summary.to_string();

        assert!(!printed.contains("SECRET-TOKEN"));
        assert!(!printed.contains("s3cret"));
        assert_eq!(
            summary["routes"]["budget_alerts"],
            serde_json::json!(["https://open.feishu.cn/***"])
        );
        assert_eq!(redact_url("not a url"), "***");
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.alerting.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_settings_update_replaces_snapshot() {
        let shared = SharedSettings::new(AlertingSettings::default());
        let before = shared.current();

        shared.update(|s| s.batch_size = 3);

        assert_eq!(before.batch_size, 512);
        assert_eq!(shared.current().batch_size, 3);
    }

    #[test]
    fn test_endpoints_deserialize_single_or_list() {
        let raw: HashMap<String, Endpoints> = serde_json::from_value(serde_json::json!({
            "default": "https://one",
            "budget_alerts": ["https://a", "https://b"],
        }))
        .unwrap();

        assert_eq!(raw["default"], Endpoints::One("https://one".to_string()));
        assert_eq!(raw["budget_alerts"], Endpoints::Many(urls(&["https://a", "https://b"])));
    }
}
