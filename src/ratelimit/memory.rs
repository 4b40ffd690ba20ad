//! In-process score store.
//!
//! Keeps every event record in a concurrent map keyed by identity. Each key
//! holds an unordered set of `(id, recorded_at)` pairs, so two events landing
//! on the same instant are still counted twice. Useful for single-instance
//! deployments and tests; state is lost on restart.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{ScoreStore, StoreError};

/// In-memory score store backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Event records indexed by identity key
    records: DashMap<String, HashMap<Uuid, Instant>>,
}

/// Whether a record still falls inside the counting interval `(now - window, now]`.
fn is_counted(recorded_at: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(recorded_at) < window
}

/// Whether a record must be kept; only records older than `now - window` go.
fn is_retained(recorded_at: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(recorded_at) <= window
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired records for every key and forget keys left empty.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, window: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();

        self.records.retain(|_, records| {
            records.retain(|_, recorded_at| is_retained(*recorded_at, now, window));
            !records.is_empty()
        });

        before.saturating_sub(self.records.len())
    }

    /// Spawn a task that sweeps the store every `interval`.
    ///
    /// The task holds a weak reference and exits once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, window: Duration, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(live) = store.upgrade() else {
                    debug!("Memory store dropped, stopping sweeper");
                    break;
                };
                let removed = live.sweep(window);
                if removed > 0 {
                    debug!(removed = removed, "Swept idle rate limit keys");
                }
            }
        })
    }

    /// Get the number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    /// Get the number of stored records for a key, expired or not.
    pub fn stored_records(&self, key: &str) -> usize {
        self.records.get(key).map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ScoreStore for MemoryStore {
    async fn count_events(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let count = self
            .records
            .get(key)
            .map(|records| {
                records
                    .values()
                    .filter(|recorded_at| is_counted(**recorded_at, now, window))
                    .count()
            })
            .unwrap_or(0);

        trace!(key = %key, count = count, "Counted events");
        Ok(count as u64)
    }

    async fn record_event(&self, key: &str, window: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut records = self.records.entry(key.to_string()).or_default();

        records.insert(Uuid::new_v4(), now);
        records.retain(|_, recorded_at| is_retained(*recorded_at, now, window));

        trace!(key = %key, stored = records.len(), "Recorded event");
        Ok(())
    }
}
