//! Error categorisation and fallback hints, plus the circuit breaker registry.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{
    AgentError, ConcurrencyError, Error, LlmError, PoolError, Result, RetryError,
};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
};
use crate::resilience::retry::{RetryConfig, retry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Authentication,
    Timeout,
    Network,
    Configuration,
    Processing,
    Validation,
    Resource,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Configuration => "configuration",
            Self::Processing => "processing",
            Self::Validation => "validation",
            Self::Resource => "resource",
            Self::Unknown => "unknown",
        }
    }

    /// Default severity for errors in this category.
    pub fn severity(self) -> ErrorSeverity {
        match self {
            Self::RateLimit => ErrorSeverity::Low,
            Self::Authentication | Self::Configuration | Self::Resource => ErrorSeverity::High,
            Self::Timeout | Self::Network | Self::Processing | Self::Validation | Self::Unknown => {
                ErrorSeverity::Medium
            }
        }
    }

    pub fn suggested_action(self) -> &'static str {
        match self {
            Self::RateLimit => "retry_with_backoff",
            Self::Timeout => "retry_with_shorter_timeout",
            Self::Authentication => "check_credentials",
            Self::Network => "check_network",
            Self::Processing | Self::Validation => "validate_input",
            Self::Configuration => "check_configuration",
            Self::Resource => "check_resources",
            Self::Unknown => "retry_or_contact_support",
        }
    }

    fn fallback_message(self) -> &'static str {
        match self {
            Self::RateLimit => "Rate limit exceeded. Please wait before retrying.",
            Self::Timeout => "Request timed out. Try again with a shorter request.",
            Self::Authentication => "Authentication failed. Check your API credentials.",
            Self::Network => "Network error. Check connectivity and retry.",
            Self::Processing | Self::Validation => "Request could not be processed. Check the input.",
            Self::Configuration => "Configuration error. Check your settings.",
            Self::Resource => "A required resource is unavailable.",
            Self::Unknown => "Unexpected error. Retry, or contact support if it persists.",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where an error happened.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub request_id: Option<String>,
    pub agent_name: Option<String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }
}

/// Recovery hint attached to an [`ErrorResponse`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackResult {
    pub suggested_action: String,
    pub message: String,
    /// Seconds, when the error carries a retry hint.
    pub retry_after: Option<f64>,
}

/// Structured, caller-facing description of a handled error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub fallback_used: bool,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    /// Keyed `"<component>:<category>"`.
    pub error_counts: BTreeMap<String, u64>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSnapshot>,
}

/// Map an error onto its category.
pub fn categorize_error(err: &Error) -> ErrorCategory {
    match err {
        Error::Config(_) => ErrorCategory::Configuration,
        Error::Concurrency(e) => match e {
            ConcurrencyError::RateLimited { .. } => ErrorCategory::RateLimit,
            ConcurrencyError::Timeout { .. } => ErrorCategory::Timeout,
            ConcurrencyError::BatchSizeMismatch { .. } => ErrorCategory::Processing,
            ConcurrencyError::ShutDown => ErrorCategory::Resource,
        },
        Error::Pool(e) => match e {
            PoolError::ConnectionFailed { .. } => ErrorCategory::Network,
            PoolError::TypeMismatch { .. } => ErrorCategory::Configuration,
        },
        Error::Llm(e) => match e {
            LlmError::RateLimited { .. } => ErrorCategory::RateLimit,
            LlmError::AuthFailed { .. } => ErrorCategory::Authentication,
            LlmError::Timeout { .. } => ErrorCategory::Timeout,
            LlmError::RequestFailed { .. }
            | LlmError::ServerError { .. }
            | LlmError::CircuitOpen { .. } => ErrorCategory::Network,
        },
        Error::Agent(e) => match e {
            AgentError::ProcessingFailed { .. } => ErrorCategory::Processing,
            AgentError::InvalidInput { .. } => ErrorCategory::Validation,
            AgentError::ResourceUnavailable { .. } => ErrorCategory::Resource,
        },
        Error::Retry(RetryError::Exhausted { last_error, .. }) => categorize_error(last_error),
        Error::Internal(_) => ErrorCategory::Unknown,
    }
}

fn severity_of(err: &Error, category: ErrorCategory) -> ErrorSeverity {
    match err {
        Error::Concurrency(ConcurrencyError::ShutDown) => ErrorSeverity::Critical,
        _ => category.severity(),
    }
}

/// Central place for turning errors into responses and guarding dependencies.
#[derive(Default)]
pub struct ErrorHandler {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    error_counts: Mutex<HashMap<String, u64>>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn categorize_error(&self, err: &Error) -> ErrorCategory {
        categorize_error(err)
    }

    /// Record, log and describe `err`.
    pub fn handle_error(
        &self,
        err: &Error,
        context: &ErrorContext,
        use_fallback: bool,
    ) -> ErrorResponse {
        let category = categorize_error(err);
        let severity = severity_of(err, category);

        let key = format!("{}:{}", context.component, category);
        *self
            .error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(0) += 1;

        match severity {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                component = %context.component,
                operation = %context.operation,
                category = %category,
                error = %err,
                "Error handled"
            ),
            ErrorSeverity::Medium => warn!(
                component = %context.component,
                operation = %context.operation,
                category = %category,
                error = %err,
                "Error handled"
            ),
            ErrorSeverity::Low => info!(
                component = %context.component,
                operation = %context.operation,
                category = %category,
                error = %err,
                "Error handled"
            ),
        }

        let mut metadata = json!({
            "component": context.component,
            "operation": context.operation,
            "request_id": context.request_id,
            "agent_name": context.agent_name,
        });
        if use_fallback {
            let fallback = FallbackResult {
                suggested_action: category.suggested_action().to_string(),
                message: category.fallback_message().to_string(),
                retry_after: err.retry_after().map(|d| d.as_secs_f64()),
            };
            metadata["fallback_result"] = json!(fallback);
        }

        ErrorResponse {
            error_code: format!("{}_{}", category, err.kind()).to_uppercase(),
            message: err.to_string(),
            category,
            severity,
            fallback_used: use_fallback,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Register a breaker under `config.name`, replacing any existing one.
    pub fn register_circuit_breaker(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let name = config.name.clone();
        let breaker = Arc::new(CircuitBreaker::new(config));
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::clone(&breaker));
        debug!(breaker = %name, "Registered circuit breaker");
        breaker
    }

    pub fn get_circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn breaker_for(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(config.name.clone())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(config))),
        )
    }

    /// Run `func` behind the breaker named by `config`, registering it on first use.
    pub async fn call_with_circuit_breaker<T, F, Fut>(
        &self,
        config: CircuitBreakerConfig,
        func: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker_for(config).call(func).await
    }

    pub async fn with_retry<T, F, Fut>(&self, config: &RetryConfig, func: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(config, func).await
    }

    pub fn circuit_breaker_states(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.get_state()))
            .collect()
    }

    pub fn get_error_statistics(&self) -> ErrorStatistics {
        let error_counts: BTreeMap<String, u64> = self
            .error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        ErrorStatistics {
            total_errors: error_counts.values().sum(),
            error_counts,
            circuit_breakers: self.circuit_breaker_states(),
        }
    }

    pub fn reset_statistics(&self) {
        self.error_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
