//! In-flight request models

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request registered with the hanging request monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRequest {
    /// Unique request identifier
    pub request_id: String,

    /// Requested model
    pub model: String,

    /// Upstream endpoint the request was routed to
    pub api_base: Option<String>,

    /// Alias of the API key that issued the request
    pub key_alias: Option<String>,

    /// Alias of the team owning the key
    pub team_alias: Option<String>,

    /// Free-form metadata forwarded to the alert
    #[serde(default)]
    pub alerting_metadata: serde_json::Value,
}

impl TrackedRequest {
    /// Create a tracked request with only the identifying fields set
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            api_base: None,
            key_alias: None,
            team_alias: None,
            alerting_metadata: serde_json::Value::Null,
        }
    }
}

/// Completion state reported by the request status store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Request finished successfully
    Success,
    /// Request finished with an error
    Failure,
    /// No status recorded
    NotFound,
}

impl RequestStatus {
    /// Whether the request has finished, either way
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestStatus::Success | RequestStatus::Failure)
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Failure => "failure",
            RequestStatus::NotFound => "not_found",
        }
    }
}

/// Outcome of a finished request, reported through the observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// Request identifier
    pub request_id: String,

    /// Deployment (model id) that served the request
    pub deployment_id: String,

    /// Requested model
    pub model: String,

    /// Upstream endpoint
    pub api_base: Option<String>,

    /// Key alias
    pub key_alias: Option<String>,

    /// Team alias
    pub team_alias: Option<String>,

    /// Wall time between request start and end
    pub elapsed: Duration,

    /// Completion tokens produced (successful requests only)
    pub completion_tokens: Option<u64>,

    /// Upstream HTTP status code for failed requests
    pub error_status: Option<u16>,

    /// Whether the request succeeded
    pub success: bool,

    /// Free-form metadata forwarded to alerts
    #[serde(default)]
    pub alerting_metadata: serde_json::Value,
}

impl RequestOutcome {
    /// Latency normalised by completion tokens when available
    pub fn latency_per_output_token(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        match self.completion_tokens {
            Some(tokens) if tokens > 0 => secs / tokens as f64,
            _ => secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(elapsed_ms: u64, tokens: Option<u64>) -> RequestOutcome {
        RequestOutcome {
            request_id: "r1".to_string(),
            deployment_id: "d1".to_string(),
            model: "gpt-4o".to_string(),
            api_base: None,
            key_alias: None,
            team_alias: None,
            elapsed: Duration::from_millis(elapsed_ms),
            completion_tokens: tokens,
            error_status: None,
            success: true,
            alerting_metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_latency_per_output_token() {
        assert!((outcome(2000, Some(100)).latency_per_output_token() - 0.02).abs() < 1e-9);
        assert!((outcome(2000, Some(0)).latency_per_output_token() - 2.0).abs() < 1e-9);
        assert!((outcome(1500, None).latency_per_output_token() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_status_completion() {
        assert!(RequestStatus::Success.is_completed());
        assert!(RequestStatus::Failure.is_completed());
        assert!(!RequestStatus::NotFound.is_completed());
    }
}
