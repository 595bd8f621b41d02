//! Concurrency core: admission, scheduling and pooling.
//!
//! Core components:
//! - `rate_limiter`: Token bucket with rolling minute/hour caps
//! - `pool`: Bounded connection pool with idle expiry
//! - `metrics`: Request counters and response-time average
//! - `processor`: `ConcurrentProcessor` façade tying the above together

pub mod metrics;
pub mod pool;
pub mod processor;
pub mod rate_limiter;

pub use metrics::{MetricsRecorder, ProcessingMetrics};
pub use pool::{ConnectionPool, ManagedPool, PoolConnection, PoolStats, PooledConnection};
pub use processor::{ConcurrentProcessor, ProcessorStatus};
pub use rate_limiter::RateLimiter;
