//! Error types for Agent Gate.

use std::time::Duration;

/// Top-level error type for the processing core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for denials the core issues to protect itself or a dependency
    /// (rate limit, open circuit, timeout), as opposed to a downstream failure.
    pub fn is_protective(&self) -> bool {
        matches!(
            self,
            Self::Concurrency(ConcurrencyError::RateLimited { .. })
                | Self::Concurrency(ConcurrencyError::Timeout { .. })
                | Self::Llm(LlmError::CircuitOpen { .. })
        )
    }

    /// Whether a caller-side retry has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Concurrency(e) => matches!(
                e,
                ConcurrencyError::RateLimited { .. } | ConcurrencyError::Timeout { .. }
            ),
            Self::Pool(PoolError::ConnectionFailed { .. }) => true,
            Self::Llm(e) => matches!(
                e,
                LlmError::RequestFailed { .. }
                    | LlmError::RateLimited { .. }
                    | LlmError::Timeout { .. }
                    | LlmError::ServerError { .. }
            ),
            _ => false,
        }
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Concurrency(ConcurrencyError::RateLimited { retry_after, .. }) => {
                Some(*retry_after)
            }
            Self::Llm(LlmError::RateLimited { retry_after, .. }) => *retry_after,
            Self::Llm(LlmError::CircuitOpen { retry_after, .. }) => Some(*retry_after),
            _ => None,
        }
    }

    /// Short variant name, used to build error codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Concurrency(ConcurrencyError::RateLimited { .. }) => "rate_limited",
            Self::Concurrency(ConcurrencyError::Timeout { .. }) => "timeout",
            Self::Concurrency(_) => "concurrency",
            Self::Pool(_) => "pool",
            Self::Llm(LlmError::CircuitOpen { .. }) => "circuit_open",
            Self::Llm(LlmError::RateLimited { .. }) => "llm_rate_limited",
            Self::Llm(LlmError::AuthFailed { .. }) => "llm_auth",
            Self::Llm(LlmError::Timeout { .. }) => "llm_timeout",
            Self::Llm(LlmError::ServerError { .. }) => "llm_server",
            Self::Llm(_) => "llm",
            Self::Agent(AgentError::InvalidInput { .. }) => "invalid_input",
            Self::Agent(_) => "agent",
            Self::Retry(_) => "retry",
            Self::Internal(_) => "internal",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Admission and scheduling errors raised by the processor itself.
#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error("Rate limit exceeded for request {request_id}, retry after {retry_after:?}")]
    RateLimited {
        request_id: String,
        retry_after: Duration,
    },

    #[error("Request {request_id} timed out after {timeout:?}")]
    Timeout {
        request_id: String,
        timeout: Duration,
    },

    #[error("Batch processor returned {actual} results for {expected} requests")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("Processor is shut down")]
    ShutDown,
}

/// Connection pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to create connection for pool {pool}: {reason}")]
    ConnectionFailed { pool: String, reason: String },

    #[error("Pool {pool} already exists with a different connection type")]
    TypeMismatch { pool: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} request timeout")]
    Timeout { provider: String },

    #[error("Provider {provider} server error: {reason}")]
    ServerError { provider: String, reason: String },

    #[error("Circuit breaker '{name}' is OPEN")]
    CircuitOpen { name: String, retry_after: Duration },
}

/// Errors surfaced by agent handlers.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {agent} processing failed: {reason}")]
    ProcessingFailed { agent: String, reason: String },

    #[error("Invalid input for agent {agent}: {reason}")]
    InvalidInput { agent: String, reason: String },

    #[error("Agent {agent} needs unavailable resource: {resource}")]
    ResourceUnavailable { agent: String, resource: String },
}

/// Retry wrapper errors.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("Operation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: Box<Error>,
    },
}

/// Result type alias for the processing core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protective_errors_are_distinguishable() {
        let rate: Error = ConcurrencyError::RateLimited {
            request_id: "r1".into(),
            retry_after: Duration::from_secs(1),
        }
        .into();
        let open: Error = LlmError::CircuitOpen {
            name: "openai".into(),
            retry_after: Duration::from_secs(30),
        }
        .into();
        let downstream: Error = LlmError::ServerError {
            provider: "openai".into(),
            reason: "502".into(),
        }
        .into();

        assert!(rate.is_protective());
        assert!(open.is_protective());
        assert!(!downstream.is_protective());
    }

    #[test]
    fn circuit_open_message() {
        let err: Error = LlmError::CircuitOpen {
            name: "anthropic".into(),
            retry_after: Duration::from_secs(5),
        }
        .into();
        assert!(err.to_string().contains("Circuit breaker 'anthropic' is OPEN"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn timeout_message_mentions_timed_out() {
        let err: Error = ConcurrencyError::Timeout {
            request_id: "slow".into(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert!(err.to_string().contains("timed out"));
        assert!(err.is_retryable());
    }

    #[test]
    fn agent_errors_not_retryable() {
        let err: Error = AgentError::InvalidInput {
            agent: "triage".into(),
            reason: "empty body".into(),
        }
        .into();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "invalid_input");
    }
}
