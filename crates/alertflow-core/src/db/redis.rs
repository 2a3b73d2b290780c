//! Redis-backed stores

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolSettings, Connection, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;

use crate::error::{Error, Result};
use crate::models::RequestStatus;

use super::{request_status_key, RequestStatusStore, UsageStore};

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
}

impl RedisPool {
    /// Create a new Redis connection pool
    pub fn new(url: &str, max_connections: usize) -> Result<Self> {
        let mut cfg = PoolSettings::from_url(url);
        cfg.pool = Some(PoolConfig::new(max_connections.max(1)));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::store(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::store(e.to_string()))
    }
}

/// [`UsageStore`] on Redis counters
#[derive(Clone)]
pub struct RedisUsageStore {
    pool: RedisPool,
}

impl RedisUsageStore {
    /// Create a usage store on a pool
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn increment(&self, key: &str, by: f64) -> Result<f64> {
        let mut conn = self.pool.connection().await?;
        let value: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(by)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<f64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.connection().await?;
        let values: Vec<Option<f64>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn get(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.pool.connection().await?;
        let value: Option<f64> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: f64, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.pool.connection().await?;
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }
}

/// [`RequestStatusStore`] on `request_status:{id}` keys
#[derive(Clone)]
pub struct RedisRequestStatusStore {
    pool: RedisPool,
    ttl: Duration,
}

impl RedisRequestStatusStore {
    /// Create a status store whose keys expire after `ttl`
    pub fn new(pool: RedisPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

fn parse_status(raw: Option<String>) -> RequestStatus {
    match raw.as_deref() {
        Some("success") => RequestStatus::Success,
        Some("failure") => RequestStatus::Failure,
        _ => RequestStatus::NotFound,
    }
}

#[async_trait]
impl RequestStatusStore for RedisRequestStatusStore {
    async fn get_status(&self, request_id: &str) -> Result<RequestStatus> {
        let mut conn = self.pool.connection().await?;
        let raw: Option<String> = conn.get(request_status_key(request_id)).await?;
        Ok(parse_status(raw))
    }

    async fn set_status(&self, request_id: &str, status: RequestStatus) -> Result<()> {
        let mut conn = self.pool.connection().await?;
        let _: () = conn
            .set_ex(
                request_status_key(request_id),
                status.as_str(),
                self.ttl.as_secs().max(1),
            )
            .await?;
        Ok(())
    }
}
