//! Alert data models

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Category of an alert, used for routing and squashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Upstream LLM call raised an exception
    LlmExceptions,
    /// Response took longer than the alerting threshold
    LlmTooSlow,
    /// Request started but never completed within the threshold
    LlmRequestsHanging,
    /// Key, team or user budget crossed
    BudgetAlerts,
    /// Database error in the serving pipeline
    DbExceptions,
    /// Periodic deployment latency/failure report
    DailyReports,
    /// Weekly or monthly spend report
    SpendReports,
    /// Fallback statistics report
    FallbackReports,
    /// Deployment error burst (minor or major outage)
    OutageAlerts,
}

impl AlertType {
    /// Every alert type, in declaration order
    pub const ALL: [AlertType; 9] = [
        AlertType::LlmExceptions,
        AlertType::LlmTooSlow,
        AlertType::LlmRequestsHanging,
        AlertType::BudgetAlerts,
        AlertType::DbExceptions,
        AlertType::DailyReports,
        AlertType::SpendReports,
        AlertType::FallbackReports,
        AlertType::OutageAlerts,
    ];

    /// Wire name (`snake_case`)
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LlmExceptions => "llm_exceptions",
            AlertType::LlmTooSlow => "llm_too_slow",
            AlertType::LlmRequestsHanging => "llm_requests_hanging",
            AlertType::BudgetAlerts => "budget_alerts",
            AlertType::DbExceptions => "db_exceptions",
            AlertType::DailyReports => "daily_reports",
            AlertType::SpendReports => "spend_reports",
            AlertType::FallbackReports => "fallback_reports",
            AlertType::OutageAlerts => "outage_alerts",
        }
    }

    /// Human title, e.g. `Llm Requests Hanging`
    pub fn title(&self) -> String {
        self.as_str()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown alert type: {s}")))
    }
}

/// Alert severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Severity {
    /// Informational
    #[default]
    Low,
    /// Needs attention
    Medium,
    /// Needs immediate attention
    High,
}

impl Severity {
    /// Card header template colour
    pub fn template_color(&self) -> &'static str {
        match self {
            Severity::High => "red",
            Severity::Medium => "orange",
            Severity::Low => "blue",
        }
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(Error::validation(format!("unknown severity: {other}"))),
        }
    }
}

/// Text fragment inside an interactive card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardText {
    /// Rendering tag (`plain_text` or `lark_md`)
    pub tag: String,
    /// Text body
    pub content: String,
}

/// Card-wide display options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardConfig {
    /// Render the card in wide mode
    pub wide_screen_mode: bool,
}

/// Card header with title and colour template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardHeader {
    /// Header title
    pub title: CardText,
    /// Colour template name
    pub template: String,
}

/// A single card body element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardElement {
    /// Element tag
    pub tag: String,
    /// Element text
    pub text: CardText,
}

/// Interactive card document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardContent {
    /// Display options
    pub config: CardConfig,
    /// Header
    pub header: CardHeader,
    /// Body elements
    pub elements: Vec<CardElement>,
}

impl CardContent {
    /// Build a single-section markdown card
    pub fn markdown(title: &str, message: &str, severity: Severity) -> Self {
        Self {
            config: CardConfig {
                wide_screen_mode: true,
            },
            header: CardHeader {
                title: CardText {
                    tag: "plain_text".to_string(),
                    content: title.to_string(),
                },
                template: severity.template_color().to_string(),
            },
            elements: vec![CardElement {
                tag: "div".to_string(),
                text: CardText {
                    tag: "lark_md".to_string(),
                    content: message.to_string(),
                },
            }],
        }
    }
}

/// Webhook message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum AlertPayload {
    /// Plain text message
    Text {
        /// Message text
        content: String,
    },
    /// Interactive card message
    #[serde(rename = "interactive")]
    Card {
        /// Card document
        card: CardContent,
    },
}

impl AlertPayload {
    /// Annotate the payload with the number of squashed alerts.
    ///
    /// Only text payloads are decorated; cards are returned untouched so the
    /// card structure is never rewritten.
    pub fn with_suppressed_count(mut self, count: usize) -> Self {
        if count > 1 {
            match &mut self {
                AlertPayload::Text { content } => {
                    *content = format!("[Num Alerts: {count}]\n\n{content}");
                }
                AlertPayload::Card { .. } => {}
            }
        }
        self
    }
}

/// A single pending alert delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertItem {
    /// Delivery endpoint (webhook URL)
    pub target: String,
    /// Outgoing request headers
    pub headers: HashMap<String, String>,
    /// Alert category
    pub alert_type: AlertType,
    /// Message body
    pub payload: AlertPayload,
}

impl AlertItem {
    /// Create an item with the default JSON content type header
    pub fn new(target: impl Into<String>, alert_type: AlertType, payload: AlertPayload) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Self {
            target: target.into(),
            headers,
            alert_type,
            payload,
        }
    }
}

/// Grouping key for squashing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SquashKey {
    /// The whole queue held a single item
    Single,
    /// Items sharing endpoint and alert type
    Group {
        /// Delivery endpoint
        target: String,
        /// Alert category
        alert_type: AlertType,
    },
}

/// A squashed delivery: one representative plus how many it stands for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashGroup {
    /// First-seen item for the key
    pub item: AlertItem,
    /// Number of items collapsed into this group (always >= 1)
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_alert_type_title() {
        assert_eq!(AlertType::LlmRequestsHanging.title(), "Llm Requests Hanging");
        assert_eq!(AlertType::BudgetAlerts.title(), "Budget Alerts");
    }

    #[test]
    fn test_alert_type_round_trips_wire_name() {
        for alert_type in AlertType::ALL {
            assert_eq!(alert_type.as_str().parse::<AlertType>().unwrap(), alert_type);
            let json = serde_json::to_value(alert_type).unwrap();
            assert_eq!(json, serde_json::json!(alert_type.as_str()));
        }
        assert!("not_a_type".parse::<AlertType>().is_err());
    }

    #[test]
    fn test_text_payload_decorated_when_squashed() {
        let payload = AlertPayload::Text {
            content: "budget crossed".to_string(),
        };

        assert_eq!(payload.clone().with_suppressed_count(1), payload);
        assert_eq!(
            payload.with_suppressed_count(3),
            AlertPayload::Text {
                content: "[Num Alerts: 3]\n\nbudget crossed".to_string()
            }
        );
    }

    #[test]
    fn test_card_payload_never_decorated() {
        let payload = AlertPayload::Card {
            card: CardContent::markdown("Title", "body", Severity::High),
        };

        assert_eq!(payload.clone().with_suppressed_count(5), payload);
    }

    #[test]
    fn test_card_wire_format() {
        let payload = AlertPayload::Card {
            card: CardContent::markdown("Budget Alerts Alert", "**hi**", Severity::Medium),
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["msg_type"], "interactive");
        assert_eq!(value["card"]["header"]["template"], "orange");
        assert_eq!(value["card"]["header"]["title"]["content"], "Budget Alerts Alert");
        assert_eq!(value["card"]["elements"][0]["text"]["tag"], "lark_md");
        assert_eq!(value["card"]["config"]["wide_screen_mode"], true);
    }

    #[test]
    fn test_text_wire_format() {
        let payload = AlertPayload::Text {
            content: "hello".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, serde_json::json!({"msg_type": "text", "content": "hello"}));
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("High".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!("low".parse::<Severity>().unwrap(), Severity::Low);
        assert!("urgent".parse::<Severity>().is_err());
    }
}
