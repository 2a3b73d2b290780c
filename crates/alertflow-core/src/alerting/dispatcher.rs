//! Webhook delivery for squashed alert groups

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::SharedSettings;
use crate::error::{Error, Result};
use crate::models::SquashGroup;

type HmacSha256 = Hmac<Sha256>;

/// Status and body returned by a webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: String,
}

impl HttpResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound transport used by the dispatcher
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// POST a JSON body with the given headers
    async fn post_json(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: String,
    ) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by reqwest
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a client with a request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_json(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: String,
    ) -> Result<HttpResponse> {
        let mut header_map = HeaderMap::new();
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::validation(format!("Invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::validation(format!("Invalid header value for {key}: {e}")))?;
            header_map.insert(name, value);
        }

        let response = self.client.post(url).headers(header_map).body(body).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(HttpResponse { status, body })
    }
}

/// Compute the webhook signature for a timestamp.
///
/// The HMAC key is `"{timestamp}\n{secret}"` and the message is empty; the
/// digest is base64 encoded.
pub fn sign(secret: &str, timestamp: i64) -> Result<String> {
    let string_to_sign = format!("{timestamp}\n{secret}");
    let mac = HmacSha256::new_from_slice(string_to_sign.as_bytes())
        .map_err(|e| Error::config(format!("Invalid signing secret: {e}")))?;

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// What happened to a single delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Webhook answered 2xx
    Delivered,
    /// Webhook answered with a non-2xx status
    Rejected {
        /// Status code
        status: u16,
    },
    /// Serialization or transport failed
    Failed(String),
}

/// Something that can deliver a squashed group
#[async_trait]
pub trait AlertDelivery: Send + Sync {
    /// Deliver one group. Never fails past this boundary.
    async fn deliver(&self, group: &SquashGroup) -> DeliveryOutcome;
}

/// Sends squashed groups to their webhook target
pub struct Dispatcher {
    client: Arc<dyn HttpClient>,
    settings: SharedSettings,
    signing_secret: Option<String>,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        client: Arc<dyn HttpClient>,
        settings: SharedSettings,
        signing_secret: Option<String>,
    ) -> Self {
        Self {
            client,
            settings,
            signing_secret,
        }
    }

    /// Build the JSON body: decorated payload plus signature fields
    fn build_body(&self, group: &SquashGroup) -> Result<serde_json::Value> {
        let payload = group.item.payload.clone().with_suppressed_count(group.count);
        let mut body = serde_json::to_value(&payload)?;

        if let Some(secret) = &self.signing_secret {
            let timestamp = Utc::now().timestamp();
            let signature = sign(secret, timestamp)?;
            if let Some(fields) = body.as_object_mut() {
                fields.insert("timestamp".to_string(), timestamp.to_string().into());
                fields.insert("sign".to_string(), signature.into());
            }
        }

        Ok(body)
    }

    async fn send(&self, group: &SquashGroup, body: &serde_json::Value) -> Result<HttpResponse> {
        let encoded = serde_json::to_string(body)?;
        self.client
            .post_json(&group.item.target, &group.item.headers, encoded)
            .await
    }
}

#[async_trait]
impl AlertDelivery for Dispatcher {
    async fn deliver(&self, group: &SquashGroup) -> DeliveryOutcome {
        let target = group.item.target.as_str();

        let (outcome, body) = match self.build_body(group) {
            Ok(body) => {
                let outcome = match self.send(group, &body).await {
                    Ok(response) if response.is_success() => {
                        debug!(url = %target, count = group.count, "Alert delivered");
                        DeliveryOutcome::Delivered
                    }
                    Ok(response) => {
                        debug!(
                            url = %target,
                            status = response.status,
                            error = %response.body,
                            "Error sending alert to webhook"
                        );
                        DeliveryOutcome::Rejected {
                            status: response.status,
                        }
                    }
                    Err(e) => {
                        debug!(url = %target, error = %e, "Error sending alert");
                        DeliveryOutcome::Failed(e.to_string())
                    }
                };
                (outcome, Some(body))
            }
            Err(e) => {
                debug!(url = %target, error = %e, "Error building alert body");
                (DeliveryOutcome::Failed(e.to_string()), None)
            }
        };

        if self.settings.current().args.log_to_console {
            match body {
                Some(body) => warn!(url = %target, payload = %body, "Alert payload"),
                None => warn!(url = %target, payload = ?group.item.payload, "Alert payload"),
            }
        }

        outcome
    }
}
