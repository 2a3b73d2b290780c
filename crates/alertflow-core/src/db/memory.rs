//! In-process store implementations

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::cache::TtlCache;
use crate::error::Result;
use crate::models::RequestStatus;

use super::{request_status_key, RequestStatusStore, UsageStore};

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: f64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// [`UsageStore`] backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    counters: DashMap<String, Counter>,
}

impl MemoryUsageStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<f64> {
        let value = self
            .counters
            .get(key)
            .map(|counter| counter.is_live(now).then_some(counter.value));

        match value {
            Some(Some(value)) => Some(value),
            Some(None) => {
                self.counters.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn increment(&self, key: &str, by: f64) -> Result<f64> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0.0,
            expires_at: None,
        });

        if !entry.is_live(now) {
            *entry = Counter {
                value: 0.0,
                expires_at: None,
            };
        }
        entry.value += by;
        Ok(entry.value)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<f64>>> {
        let now = Instant::now();
        Ok(keys.iter().map(|key| self.live_value(key, now)).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.live_value(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: f64, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.counters
            .insert(key.to_string(), Counter { value, expires_at });
        Ok(())
    }
}

/// [`RequestStatusStore`] keeping statuses in a [`TtlCache`]
pub struct MemoryRequestStatusStore {
    statuses: TtlCache<String, RequestStatus>,
}

impl MemoryRequestStatusStore {
    /// Create a store whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            statuses: TtlCache::new(ttl),
        }
    }
}

#[async_trait]
impl RequestStatusStore for MemoryRequestStatusStore {
    async fn get_status(&self, request_id: &str) -> Result<RequestStatus> {
        Ok(self
            .statuses
            .get(&request_status_key(request_id))
            .unwrap_or(RequestStatus::NotFound))
    }

    async fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<()> {
        self.statuses
            .set_default(request_status_key(request_id), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test]
    async fn test_increment_accumulates() {
        let store = MemoryUsageStore::new();

        assert_eq!(store.increment("d1:latency", 0.5).await.unwrap(), 0.5);
        assert_eq!(store.increment("d1:latency", 1.0).await.unwrap(), 1.5);
        assert_eq!(store.get("d1:latency").await.unwrap(), Some(1.5));
    }

    #[tokio::test]
    async fn test_batch_get_keeps_order_and_gaps() {
        let store = MemoryUsageStore::new();
        store.increment("a", 1.0).await.unwrap();
        store.increment("c", 3.0).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            store.batch_get(&keys).await.unwrap(),
            vec![Some(1.0), None, Some(3.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_with_ttl_expires() {
        let store = MemoryUsageStore::new();
        store
            .set("report_sent", 42.0, Some(Duration::from_secs(10)))
            .await
            .unwrap();

        advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("report_sent").await.unwrap(), Some(42.0));

        advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("report_sent").await.unwrap(), None);
        assert_eq!(store.increment("report_sent", 1.0).await.unwrap(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_status_roundtrip_and_expiry() {
        let store = MemoryRequestStatusStore::new(Duration::from_secs(30));
        assert_eq!(store.get_status("r1").await.unwrap(), RequestStatus::NotFound);

        store.set_status("r1", RequestStatus::Failure).await.unwrap();
        assert_eq!(store.get_status("r1").await.unwrap(), RequestStatus::Failure);

        advance(Duration::from_secs(31)).await;
        assert_eq!(store.get_status("r1").await.unwrap(), RequestStatus::NotFound);
    }
}
