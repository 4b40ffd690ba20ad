//! Ratewall - Sliding-Window HTTP Rate Limiting
//!
//! This crate decides, per incoming HTTP request, whether to forward it or
//! reject it based on how many requests the same identity made within a
//! trailing window. Counts live in a pluggable score store: an in-process
//! map for single instances or Redis sorted sets for shared limits.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod server;
