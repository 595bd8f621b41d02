//! Resilience layer wrapped around calls to external dependencies.
//!
//! The concurrency core never retries and never trips breakers itself;
//! callers compose these around `ConcurrentProcessor` calls.

pub mod circuit_breaker;
pub mod handler;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use handler::{
    ErrorCategory, ErrorContext, ErrorHandler, ErrorResponse, ErrorSeverity, ErrorStatistics,
    FallbackResult, categorize_error,
};
pub use retry::{RetryConfig, retry, retry_if};
