//! Collaborator stores
//!
//! The engine reads and writes two small key/value stores: numeric usage
//! counters feeding the daily report, and the completion status of requests
//! consulted by the hanging request monitor. Both come in an in-memory and a
//! Redis flavour.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::{MemoryRequestStatusStore, MemoryUsageStore};
pub use self::redis::{RedisPool, RedisRequestStatusStore, RedisUsageStore};

use crate::error::Result;
use crate::models::RequestStatus;

/// Numeric counter store
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Add `by` to a counter, creating it at zero. Returns the new value.
    async fn increment(&self, key: &str, by: f64) -> Result<f64>;

    /// Fetch several counters; missing keys come back as `None`
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<f64>>>;

    /// Fetch one counter
    async fn get(&self, key: &str) -> Result<Option<f64>>;

    /// Overwrite a value, optionally expiring it
    async fn set(&self, key: &str, value: f64, ttl: Option<Duration>) -> Result<()>;
}

/// Request completion status store
#[async_trait]
pub trait RequestStatusStore: Send + Sync {
    /// Status of a request; [`RequestStatus::NotFound`] when nothing is recorded
    async fn get_status(&self, request_id: &str) -> Result<RequestStatus>;

    /// Record a request's final status
    async fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<()>;
}

/// Key under which a request's status is stored
pub fn request_status_key(request_id: &str) -> String {
    format!("request_status:{request_id}")
}
