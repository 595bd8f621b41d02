//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Concurrency limits for the request processor.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Hard cap on in-flight units of work across the process.
    pub max_concurrent_requests: usize,
    /// Cap per agent name.
    pub max_concurrent_per_agent: usize,
    /// Cap per LLM provider name.
    pub max_concurrent_per_llm_provider: usize,
    /// Deadline for a single unit of work.
    pub request_timeout: Duration,
    /// Group `batch_process` inputs into chunks of `batch_size`.
    pub enable_request_batching: bool,
    pub batch_size: usize,
    /// Deadline for one batch group.
    pub batch_timeout: Duration,
    /// How often idle pooled connections are swept.
    pub pool_sweep_interval: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_concurrent_per_agent: 3,
            max_concurrent_per_llm_provider: 5,
            request_timeout: Duration::from_secs(30),
            enable_request_batching: true,
            batch_size: 5,
            batch_timeout: Duration::from_secs(30),
            pool_sweep_interval: Duration::from_secs(60), // 1 minute
        }
    }
}

impl ConcurrencyConfig {
    /// Build from `AGENT_GATE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_requests: env_parse(
                "AGENT_GATE_MAX_CONCURRENT",
                defaults.max_concurrent_requests,
            ),
            max_concurrent_per_agent: env_parse(
                "AGENT_GATE_MAX_PER_AGENT",
                defaults.max_concurrent_per_agent,
            ),
            max_concurrent_per_llm_provider: env_parse(
                "AGENT_GATE_MAX_PER_PROVIDER",
                defaults.max_concurrent_per_llm_provider,
            ),
            request_timeout: env_secs("AGENT_GATE_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            enable_request_batching: env_parse(
                "AGENT_GATE_BATCHING",
                defaults.enable_request_batching,
            ),
            batch_size: env_parse("AGENT_GATE_BATCH_SIZE", defaults.batch_size),
            batch_timeout: env_secs("AGENT_GATE_BATCH_TIMEOUT_SECS", defaults.batch_timeout),
            pool_sweep_interval: env_secs(
                "AGENT_GATE_POOL_SWEEP_SECS",
                defaults.pool_sweep_interval,
            ),
        }
    }

    /// Reject limits the processor cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests", "must be at least 1"));
        }
        if self.max_concurrent_per_agent == 0 {
            return Err(invalid("max_concurrent_per_agent", "must be at least 1"));
        }
        if self.max_concurrent_per_llm_provider == 0 {
            return Err(invalid(
                "max_concurrent_per_llm_provider",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_per_agent > self.max_concurrent_requests {
            return Err(invalid(
                "max_concurrent_per_agent",
                "cannot exceed max_concurrent_requests",
            ));
        }
        if self.max_concurrent_per_llm_provider > self.max_concurrent_requests {
            return Err(invalid(
                "max_concurrent_per_llm_provider",
                "cannot exceed max_concurrent_requests",
            ));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("request_timeout", "must be non-zero"));
        }
        if self.pool_sweep_interval.is_zero() {
            return Err(invalid("pool_sweep_interval", "must be non-zero"));
        }
        Ok(())
    }
}

/// Admission rate limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Token bucket capacity.
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_limit: 10,
        }
    }
}

impl RateLimitConfig {
    /// Build from `AGENT_GATE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            requests_per_minute: env_parse("AGENT_GATE_RPM", defaults.requests_per_minute),
            requests_per_hour: env_parse("AGENT_GATE_RPH", defaults.requests_per_hour),
            burst_limit: env_parse("AGENT_GATE_BURST", defaults.burst_limit),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_limit == 0 {
            return Err(invalid("burst_limit", "must be at least 1"));
        }
        if self.requests_per_minute == 0 {
            return Err(invalid("requests_per_minute", "must be at least 1"));
        }
        if self.requests_per_hour == 0 {
            return Err(invalid("requests_per_hour", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ConcurrencyConfig::default().validate().is_ok());
        assert!(RateLimitConfig::default().validate().is_ok());
    }

    #[test]
    fn per_agent_cap_above_global_is_rejected() {
        let config = ConcurrencyConfig {
            max_concurrent_requests: 2,
            max_concurrent_per_agent: 5,
            ..ConcurrencyConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_per_agent"));
    }

    #[test]
    fn zero_burst_is_rejected() {
        let config = RateLimitConfig {
            burst_limit: 0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("AGENT_GATE_TEST_GARBAGE", "not-a-number") };
        assert_eq!(env_parse("AGENT_GATE_TEST_GARBAGE", 7usize), 7);
        unsafe { std::env::set_var("AGENT_GATE_TEST_SECS", "1.5") };
        assert_eq!(
            env_secs("AGENT_GATE_TEST_SECS", Duration::ZERO),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn env_secs_falls_back_when_out_of_range() {
        let default = Duration::from_secs(30);
        // SAFETY: the variable names are unique to this test.
        unsafe { std::env::set_var("AGENT_GATE_TEST_HUGE_SECS", "1e30") };
        assert_eq!(env_secs("AGENT_GATE_TEST_HUGE_SECS", default), default);
        unsafe { std::env::set_var("AGENT_GATE_TEST_NEGATIVE_SECS", "-1") };
        assert_eq!(env_secs("AGENT_GATE_TEST_NEGATIVE_SECS", default), default);
        unsafe { std::env::set_var("AGENT_GATE_TEST_INF_SECS", "inf") };
        assert_eq!(env_secs("AGENT_GATE_TEST_INF_SECS", default), default);
    }
}
