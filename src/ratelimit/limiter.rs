//! Core rate limiter implementation.

use axum::http::HeaderMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::backend::{ScoreStore, StoreError};
use super::identity::{HeaderLimits, IdentityKey};
use super::timeframe::Timeframe;
use crate::config::RateLimitingConfig;
use crate::error::{RatewallError, Result};

/// Default request limit when none is configured.
pub const DEFAULT_LIMIT: u64 = 30;
/// Default time window when none is configured.
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::Rps;

/// Why a request was not admitted.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The identity already used up its limit for the current window.
    #[error("you have reached the maximum number of requests or actions allowed within a certain time frame")]
    LimitExceeded {
        key: IdentityKey,
        limit: u64,
        count: u64,
    },

    /// The score store could not be read; the request is not admitted.
    #[error("rate limiter backend unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

/// A successful admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Key the request was counted against
    pub key: IdentityKey,
    /// Limit that applied to the key
    pub limit: u64,
    /// Events already in the window before this request
    pub count: u64,
}

impl Admission {
    /// Requests left in the window after this one.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count + 1)
    }
}

/// Running totals of admission outcomes.
#[derive(Debug, Default)]
struct LimiterStats {
    admitted: AtomicU64,
    limited: AtomicU64,
    store_failures: AtomicU64,
    missed_records: AtomicU64,
}

/// Point-in-time copy of the limiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Requests let through
    pub admitted: u64,
    /// Requests rejected for exceeding their limit
    pub limited: u64,
    /// Requests rejected because the store could not be read
    pub store_failures: u64,
    /// Admitted requests whose event could not be recorded
    pub missed_records: u64,
}

/// The sliding-window rate limiter.
///
/// Configuration is fixed at construction and read without locking; the
/// score store owns all shared mutable state.
pub struct RateLimiter {
    /// Where event records live
    store: Arc<dyn ScoreStore>,
    /// Limit applied to address-derived keys
    max_requests_per_time: u64,
    /// Window every key is counted over
    timeframe: Timeframe,
    /// Header overrides, `None` when header limiting is disabled
    header_limits: Option<HeaderLimits>,
    stats: LimiterStats,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests_per_time", &self.max_requests_per_time)
            .field("timeframe", &self.timeframe)
            .field("header_limits", &self.header_limits)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a rate limiter with default settings.
    pub fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self {
            store,
            max_requests_per_time: DEFAULT_LIMIT,
            timeframe: DEFAULT_TIMEFRAME,
            header_limits: None,
            stats: LimiterStats::default(),
        }
    }

    /// Start building a rate limiter on top of `store`.
    pub fn builder(store: Arc<dyn ScoreStore>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(store)
    }

    /// Create a rate limiter from loaded configuration.
    pub fn from_config(store: Arc<dyn ScoreStore>, config: &RateLimitingConfig) -> Result<Self> {
        let mut builder = Self::builder(store)
            .with_request_limit(config.max_requests_per_time)
            .with_timeframe(config.timeframe);

        if let Some(ref limits) = config.header_limiter {
            builder = builder.with_header_limits(limits.clone());
        }

        builder.build()
    }

    /// Work out which key a request counts against and the limit for it.
    ///
    /// The first configured override header present on the request wins;
    /// otherwise the client address is used with the default limit.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> (IdentityKey, u64) {
        if let Some(found) = self
            .header_limits
            .as_ref()
            .and_then(|limits| limits.find_match(headers))
        {
            return (
                IdentityKey::from_header(found.header.clone(), &found.value),
                found.limit,
            );
        }

        (
            IdentityKey::from_address(headers, peer),
            self.max_requests_per_time,
        )
    }

    /// Decide whether a request may pass.
    pub async fn admit(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> std::result::Result<Admission, AdmissionError> {
        let (key, limit) = self.resolve(headers, peer);
        self.admit_key(key, limit).await
    }

    /// Decide whether one more event for `key` fits under `limit`.
    ///
    /// A failed count rejects the request. A failed record after the request
    /// was admitted is logged and counted but does not change the outcome.
    pub async fn admit_key(
        &self,
        key: IdentityKey,
        limit: u64,
    ) -> std::result::Result<Admission, AdmissionError> {
        let window = self.window();

        trace!(key = %key, limit = limit, window = ?window, "Checking rate limit");

        let count = match self.store.count_events(key.as_str(), window).await {
            Ok(count) => count,
            Err(e) => {
                self.stats.store_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AdmissionError::StoreUnavailable(e));
            }
        };

        if count >= limit {
            self.stats.limited.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, count = count, limit = limit, "Rate limit exceeded");
            return Err(AdmissionError::LimitExceeded { key, limit, count });
        }

        if let Err(e) = self.store.record_event(key.as_str(), window).await {
            self.stats.missed_records.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "Failed to record admitted request");
        }

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(Admission { key, limit, count })
    }

    /// Get the default request limit.
    pub fn max_requests_per_time(&self) -> u64 {
        self.max_requests_per_time
    }

    /// Get the configured timeframe.
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Get the window duration every key is counted over.
    pub fn window(&self) -> Duration {
        self.timeframe.duration()
    }

    /// Get the header overrides, if header limiting is enabled.
    pub fn header_limits(&self) -> Option<&HeaderLimits> {
        self.header_limits.as_ref()
    }

    /// Get a snapshot of the outcome counters.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            limited: self.stats.limited.load(Ordering::Relaxed),
            store_failures: self.stats.store_failures.load(Ordering::Relaxed),
            missed_records: self.stats.missed_records.load(Ordering::Relaxed),
        }
    }
}

/// Builder for [`RateLimiter`].
///
/// Adding any header limit turns header limiting on. Configuration errors
/// are reported by [`RateLimiterBuilder::build`].
pub struct RateLimiterBuilder {
    store: Arc<dyn ScoreStore>,
    max_requests_per_time: u64,
    timeframe: Timeframe,
    header_limits: Option<HeaderLimits>,
    error: Option<RatewallError>,
}

impl RateLimiterBuilder {
    fn new(store: Arc<dyn ScoreStore>) -> Self {
        Self {
            store,
            max_requests_per_time: DEFAULT_LIMIT,
            timeframe: DEFAULT_TIMEFRAME,
            header_limits: None,
            error: None,
        }
    }

    /// Set the default request limit per window.
    pub fn with_request_limit(mut self, max_requests_per_time: u64) -> Self {
        self.max_requests_per_time = max_requests_per_time;
        self
    }

    /// Set the window granularity.
    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    /// Limit requests carrying `header` by its value instead of the address.
    pub fn with_header_limit(mut self, header: &str, max_requests_per_time: u64) -> Self {
        let limits = self.header_limits.get_or_insert_with(HeaderLimits::new);
        if let Err(e) = limits.insert(header, max_requests_per_time) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Replace the header override table.
    pub fn with_header_limits(mut self, limits: HeaderLimits) -> Self {
        self.header_limits = Some(limits);
        self
    }

    /// Validate the configuration and build the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        if let Some(e) = self.error {
            return Err(e);
        }

        if self.max_requests_per_time == 0 {
            return Err(RatewallError::Config(
                "max requests per time must be at least 1".to_string(),
            ));
        }

        debug!(
            limit = self.max_requests_per_time,
            timeframe = %self.timeframe,
            header_overrides = self.header_limits.as_ref().map_or(0, HeaderLimits::len),
            "Rate limiter configured"
        );

        Ok(RateLimiter {
            store: self.store,
            max_requests_per_time: self.max_requests_per_time,
            timeframe: self.timeframe,
            header_limits: self.header_limits,
            stats: LimiterStats::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::identity::IdentitySource;
    use crate::ratelimit::MemoryStore;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use tokio::time::advance;
    use tokio_test::{assert_err, assert_ok};

    /// Store whose reads always fail.
    struct UnreachableStore;

    #[async_trait]
    impl ScoreStore for UnreachableStore {
        async fn count_events(
            &self,
            _key: &str,
            _window: Duration,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn record_event(
            &self,
            _key: &str,
            _window: Duration,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    /// Store that counts normally but drops every write.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ScoreStore for ReadOnlyStore {
        async fn count_events(
            &self,
            key: &str,
            window: Duration,
        ) -> std::result::Result<u64, StoreError> {
            self.inner.count_events(key, window).await
        }

        async fn record_event(
            &self,
            _key: &str,
            _window: Duration,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(5)))
        }
    }

    fn peer(addr: &str) -> Option<SocketAddr> {
        Some(format!("{}:40000", addr).parse().unwrap())
    }

    fn with_header(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    fn memory_limiter(limit: u64) -> RateLimiter {
        RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_request_limit(limit)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rate_limiter_defaults() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        assert_eq!(limiter.max_requests_per_time(), 30);
        assert_eq!(limiter.timeframe(), Timeframe::Rps);
        assert_eq!(limiter.window(), Duration::from_secs(1));
        assert!(limiter.header_limits().is_none());
        assert_eq!(limiter.stats(), StatsSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_until_limit_then_rejects() {
        let limiter = memory_limiter(2);
        let headers = HeaderMap::new();

        let first = assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert_eq!(first.count, 0);
        assert_eq!(first.remaining(), 1);

        let second = assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert_eq!(second.count, 1);
        assert_eq!(second.remaining(), 0);

        let third = assert_err!(limiter.admit(&headers, peer("1.2.3.4")).await);
        match third {
            AdmissionError::LimitExceeded { key, limit, count } => {
                assert_eq!(key.as_str(), "1.2.3.4");
                assert_eq!(limit, 2);
                assert_eq!(count, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_requests_are_not_recorded() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::builder(store.clone())
            .with_request_limit(1)
            .build()
            .unwrap();
        let headers = HeaderMap::new();

        assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        for _ in 0..5 {
            assert_err!(limiter.admit(&headers, peer("1.2.3.4")).await);
        }

        assert_eq!(store.stored_records("1.2.3.4"), 1);
        assert_eq!(limiter.stats().admitted, 1);
        assert_eq!(limiter.stats().limited, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_addresses_are_limited_separately() {
        let limiter = memory_limiter(1);
        let headers = HeaderMap::new();

        assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert_ok!(limiter.admit(&headers, peer("5.6.7.8")).await);
        assert_err!(limiter.admit(&headers, peer("1.2.3.4")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_admits_again() {
        let limiter = memory_limiter(1);
        let headers = HeaderMap::new();

        assert_ok!(limiter.admit(&headers, peer("5.6.7.8")).await);
        assert_err!(limiter.admit(&headers, peer("5.6.7.8")).await);

        advance(Duration::from_millis(1100)).await;
        assert_ok!(limiter.admit(&headers, peer("5.6.7.8")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_window_holds_longer() {
        let limiter = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_request_limit(1)
            .with_timeframe(Timeframe::Rpm)
            .build()
            .unwrap();
        let headers = HeaderMap::new();

        assert_ok!(limiter.admit(&headers, peer("5.6.7.8")).await);
        advance(Duration::from_secs(30)).await;
        assert_err!(limiter.admit(&headers, peer("5.6.7.8")).await);
        advance(Duration::from_secs(31)).await;
        assert_ok!(limiter.admit(&headers, peer("5.6.7.8")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_override_uses_header_key_and_limit() {
        let limiter = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_header_limit("X-API-Key", 1)
            .build()
            .unwrap();
        let headers = with_header("x-api-key", "abc");

        let admitted = assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert_eq!(admitted.limit, 1);
        assert_eq!(admitted.key.as_str(), "abc");
        assert!(matches!(admitted.key.source, IdentitySource::Header(_)));

        // A different address does not escape the header limit
        assert_err!(limiter.admit(&headers, peer("4.3.2.1")).await);

        // Without the header the default limit of 30 applies
        assert_ok!(limiter.admit(&HeaderMap::new(), peer("1.2.3.4")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_ascii_header_value_keeps_override() {
        let limiter = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_header_limit("X-API-Key", 1)
            .build()
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_bytes("clé".as_bytes()).unwrap());

        let admitted = assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert_eq!(admitted.limit, 1);
        assert_eq!(admitted.key.as_str(), "clé");

        let err = assert_err!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert!(matches!(err, AdmissionError::LimitExceeded { limit: 1, count: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_header_limit_rejects_everything() {
        let limiter = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_header_limit("X-Blocked", 0)
            .build()
            .unwrap();

        let err = assert_err!(limiter.admit(&with_header("x-blocked", "yes"), None).await);
        assert!(matches!(err, AdmissionError::LimitExceeded { limit: 0, count: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_ip_header_is_the_key() {
        let limiter = memory_limiter(1);
        let mut headers = with_header("x-real-ip", "7.7.7.7");
        headers.insert("x-forwarded-for", HeaderValue::from_static("8.8.8.8"));

        let admitted = assert_ok!(limiter.admit(&headers, peer("1.2.3.4")).await);
        assert_eq!(admitted.key.as_str(), "7.7.7.7");
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let limiter = RateLimiter::new(Arc::new(UnreachableStore));

        let err = assert_err!(limiter.admit(&HeaderMap::new(), peer("1.2.3.4")).await);
        assert!(matches!(err, AdmissionError::StoreUnavailable(_)));
        assert_eq!(limiter.stats().store_failures, 1);
        assert_eq!(limiter.stats().admitted, 0);
    }

    #[tokio::test]
    async fn test_record_failure_still_admits() {
        let limiter = RateLimiter::builder(Arc::new(ReadOnlyStore::default()))
            .with_request_limit(1)
            .build()
            .unwrap();

        // Nothing is ever recorded, so the limit is never reached
        for _ in 0..3 {
            assert_ok!(limiter.admit(&HeaderMap::new(), peer("1.2.3.4")).await);
        }

        let stats = limiter.stats();
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.missed_records, 3);
    }

    #[test]
    fn test_zero_default_limit_rejected() {
        let result = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_request_limit(0)
            .build();
        assert!(matches!(result, Err(RatewallError::Config(_))));
    }

    #[test]
    fn test_duplicate_header_limit_rejected() {
        let result = RateLimiter::builder(Arc::new(MemoryStore::new()))
            .with_header_limit("X-API-Key", 1)
            .with_header_limit("x-api-key", 5)
            .build();
        assert!(matches!(result, Err(RatewallError::Config(_))));
    }

    #[test]
    fn test_from_config() {
        let config = RateLimitingConfig {
            max_requests_per_time: 5,
            timeframe: Timeframe::Rpm,
            header_limiter: Some(HeaderLimits::from_json(r#"{"X-API-Key": 1}"#).unwrap()),
        };

        let limiter = RateLimiter::from_config(Arc::new(MemoryStore::new()), &config).unwrap();
        assert_eq!(limiter.max_requests_per_time(), 5);
        assert_eq!(limiter.window(), Duration::from_secs(60));
        assert_eq!(limiter.header_limits().map(HeaderLimits::len), Some(1));
    }
}
