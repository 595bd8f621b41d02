//! Per-dependency circuit breaker (closed / open / half-open).
//!
//! The breaker never sits between callers and each other: only the state
//! transition is taken under the lock, the wrapped call runs unlocked.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, LlmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn count_every_failure(_: &Error) -> bool {
    true
}

/// Breaker tuning for one named dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Counted failures in CLOSED before the circuit opens.
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is let through.
    pub recovery_timeout: Duration,
    /// Consecutive HALF_OPEN successes needed to close again.
    pub success_threshold: u32,
    /// Decides which errors count as failures. Others pass through untouched.
    pub counts_failure: fn(&Error) -> bool,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Consecutive HALF_OPEN successes needed to close again.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_failure_predicate(mut self, predicate: fn(&Error) -> bool) -> Self {
        self.counts_failure = predicate;
        self
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            counts_failure: count_every_failure,
        }
    }
}

/// Serializable view returned by [`CircuitBreaker::get_state`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_failure_at: None,
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `func` through the breaker.
    ///
    /// While OPEN the call is rejected with [`LlmError::CircuitOpen`] without
    /// invoking `func`.
    pub async fn call<T, F, Fut>(&self, func: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;
        match func().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                if (self.config.counts_failure)(&e) {
                    self.on_failure(&e);
                }
                Err(e)
            }
        }
    }

    fn before_call(&self) -> Result<()> {
        let mut state = self.lock();
        if state.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = state
            .last_failure
            .map(|t| t.elapsed())
            .unwrap_or(self.config.recovery_timeout);
        if elapsed >= self.config.recovery_timeout {
            state.state = CircuitState::HalfOpen;
            state.success_count = 0;
            info!(breaker = %self.config.name, "Circuit half-open, allowing trial call");
            return Ok(());
        }

        Err(LlmError::CircuitOpen {
            name: self.config.name.clone(),
            retry_after: self.config.recovery_timeout - elapsed,
        }
        .into())
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    info!(breaker = %self.config.name, "Circuit closed");
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            // A call admitted before another caller tripped the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, error: &Error) {
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.trip();
                warn!(breaker = %self.config.name, error = %error, "Trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.trip();
                    warn!(
                        breaker = %self.config.name,
                        failures = state.failure_count,
                        error = %error,
                        "Circuit opened"
                    );
                } else {
                    debug!(breaker = %self.config.name, failures = state.failure_count, "Counted failure");
                }
            }
            CircuitState::Open => {
                state.last_failure = Some(Instant::now());
                state.last_failure_at = Some(Utc::now());
            }
        }
    }

    pub fn get_state(&self) -> CircuitBreakerSnapshot {
        let state = self.lock();
        CircuitBreakerSnapshot {
            name: self.config.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_at,
        }
    }

    /// Force the breaker back to CLOSED with zeroed counters.
    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
    }
}
