//! Redis-backed score store.
//!
//! Each identity key maps to a sorted set. Members are random UUIDs and
//! scores are the unix timestamp of the event in milliseconds:
//!
//! - record: `ZADD key now uuid`, `ZREMRANGEBYSCORE key -inf (now-window`,
//!   `PEXPIRE key window` in one pipeline
//! - count: `ZCOUNT key (now-window now`
//!
//! Multiple instances pointed at the same Redis share counts. The pipeline
//! is not combined with the count, so concurrent requests for one key may
//! briefly overshoot the limit.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{info, trace};
use uuid::Uuid;

use super::backend::{ScoreStore, StoreError};

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every identity key (default: "ratewall:")
    pub key_prefix: String,
    /// Deadline applied to each store call, if any
    pub command_timeout: Option<Duration>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratewall:".to_string(),
            command_timeout: Some(Duration::from_millis(500)),
        }
    }
}

/// Redis-backed score store shared across limiter instances.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %config.key_prefix, "Connected to Redis score store");

        Ok(Self { connection, config })
    }

    /// Get the Redis key for an identity key.
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Run a store call under the configured deadline.
    async fn with_timeout<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match self.config.command_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))?
                .map_err(StoreError::from),
            None => call.await.map_err(StoreError::from),
        }
    }
}

/// Current unix time in milliseconds.
fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Window length in milliseconds, saturating at `i64::MAX`.
fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl ScoreStore for RedisStore {
    async fn count_events(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let redis_key = self.key(key);
        let now = now_millis();
        let min = format!("({}", now.saturating_sub(window_millis(window)));
        let mut conn = self.connection.clone();

        let count: u64 = self
            .with_timeout(async move { conn.zcount(&redis_key, min, now).await })
            .await?;

        trace!(key = %key, count = count, "Counted events in Redis");
        Ok(count)
    }

    async fn record_event(&self, key: &str, window: Duration) -> Result<(), StoreError> {
        let redis_key = self.key(key);
        let now = now_millis();
        let window_ms = window_millis(window);
        let horizon = format!("({}", now.saturating_sub(window_ms));
        let member = Uuid::new_v4().to_string();
        let mut conn = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(&redis_key, member, now)
            .ignore()
            .zrembyscore(&redis_key, "-inf", horizon)
            .ignore()
            .pexpire(&redis_key, window_ms.max(1000))
            .ignore();

        let _: () = self
            .with_timeout(async move { pipe.query_async(&mut conn).await })
            .await?;

        trace!(key = %key, "Recorded event in Redis");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.key_prefix, "ratewall:");
        assert_eq!(config.command_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_window_millis_saturates() {
        assert_eq!(window_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(window_millis(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStore::connect("not-a-redis-url").await;
        assert!(matches!(result, Err(StoreError::Redis(_))));
    }
}
