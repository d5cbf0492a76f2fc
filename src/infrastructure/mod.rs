//! Infrastructure layer modules
//!
//! Shared components used by the dispatch domain:
//! - `backoff`: Exponential backoff with jitter
//! - `config`: Application configuration and settings
//! - `error`: HTTP-facing error type
//! - `metrics`: Prometheus metrics helpers
//! - `redis`: Redis connection pool and circuit breaker

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
