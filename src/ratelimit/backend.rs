//! Score store trait for abstracting in-process and networked counters.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a score store.
///
/// Every variant means the store could not answer; the limiter treats them
/// all as the store being unavailable.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for score store implementations.
///
/// A store keeps one event record per admitted request and answers how many
/// records for a key fall inside a trailing window. Counting and recording
/// are separate calls, so two requests for the same key can both read a
/// count below the limit before either records its event.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Count the events recorded for `key` in `(now - window, now]`.
    async fn count_events(&self, key: &str, window: Duration) -> Result<u64, StoreError>;

    /// Record one event for `key` at the current time and drop records
    /// for `key` that fell out of `window`.
    async fn record_event(&self, key: &str, window: Duration) -> Result<(), StoreError>;
}
