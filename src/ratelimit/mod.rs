//! Sliding-window rate limiting logic and score stores.

mod backend;
mod identity;
mod limiter;
mod memory;
mod redis_store;
mod timeframe;

pub use backend::{ScoreStore, StoreError};
pub use identity::{
    client_address, HeaderLimit, HeaderLimits, HeaderMatch, IdentityKey, IdentitySource,
    FORWARDED_FOR_HEADER, REAL_IP_HEADER, UNKNOWN_CLIENT,
};
pub use limiter::{
    Admission, AdmissionError, RateLimiter, RateLimiterBuilder, StatsSnapshot, DEFAULT_LIMIT,
    DEFAULT_TIMEFRAME,
};
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use timeframe::Timeframe;
