//! Usage, report and budget data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-request usage sample feeding the daily deployment report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    /// Deployment (model id)
    pub id: String,

    /// Whether the request failed
    pub failed_request: bool,

    /// Seconds per output token, when the request succeeded
    pub latency_per_output_token: Option<f64>,

    /// When the sample was taken
    pub updated_at: DateTime<Utc>,
}

/// Counter keys kept per deployment in the usage store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCounter {
    /// Number of failed requests
    FailedRequests,
    /// Accumulated latency per output token
    Latency,
}

impl UsageCounter {
    /// Store key for a deployment
    pub fn key(&self, deployment_id: &str) -> String {
        let suffix = match self {
            UsageCounter::FailedRequests => "failed_requests",
            UsageCounter::Latency => "latency",
        };
        format!("{deployment_id}:{suffix}")
    }
}

/// Description of a deployment known to the model registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    /// Deployment (model id)
    pub id: String,

    /// Upstream model name
    pub model: String,

    /// Upstream endpoint
    pub api_base: Option<String>,
}

/// Spend attributed to a team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSpend {
    /// Team alias
    pub team_alias: String,
    /// Total spend in USD
    pub total_spend: f64,
}

/// Spend attributed to a request tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSpend {
    /// Request tag
    pub tag: String,
    /// Total spend in USD
    pub total_spend: f64,
}

/// Spend breakdown for a date range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendReport {
    /// Spend per team
    pub per_team: Vec<TeamSpend>,
    /// Spend per tag
    pub per_tag: Vec<TagSpend>,
}

/// Kind of budget event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetEventKind {
    /// A key is about to exceed its budget
    SoftBudgetCrossed,
    /// A key exceeded its budget
    KeyBudgetExceeded,
    /// A user exceeded their budget
    UserBudgetExceeded,
    /// A team exceeded its budget
    TeamBudgetExceeded,
    /// A project exceeded its budget
    ProjectBudgetExceeded,
}

impl BudgetEventKind {
    /// Headline for the alert
    pub fn event_message(&self) -> &'static str {
        match self {
            BudgetEventKind::SoftBudgetCrossed => "Soft Budget Crossed",
            BudgetEventKind::KeyBudgetExceeded => "Key Budget: Budget Crossed",
            BudgetEventKind::UserBudgetExceeded => "User Budget: Budget Crossed",
            BudgetEventKind::TeamBudgetExceeded => "Team Budget: Budget Crossed",
            BudgetEventKind::ProjectBudgetExceeded => "Project Budget: Budget Crossed",
        }
    }
}

/// Identity and spend details attached to a budget alert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    /// Current spend
    pub spend: f64,
    /// Maximum budget, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    /// Soft budget, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soft_budget: Option<f64>,
    /// Hashed key token (never rendered)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Key alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_alias: Option<String>,
    /// User id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// User email
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    /// Team id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Team alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_alias: Option<String>,
}

impl CallInfo {
    /// Render the populated fields as markdown lines, skipping the token
    pub fn to_markdown(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let Some(fields) = value.as_object() else {
            return String::new();
        };

        let mut msg = String::new();
        for (key, value) in fields {
            if key == "token" || value.is_null() {
                continue;
            }
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            msg.push_str(&format!("**{key}:** `{rendered}`\n"));
        }
        msg
    }
}
