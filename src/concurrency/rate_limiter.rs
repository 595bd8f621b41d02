//! Token-bucket admission gate with rolling-window caps.
//!
//! Tokens refill continuously at `burst_limit / 60` per second, so an empty
//! bucket is full again after one minute. On top of the bucket, admitted
//! requests are counted over a rolling minute and a rolling hour.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
/// Shortest block applied when the hourly cap trips.
const MIN_BLOCK: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    /// Admission instants, oldest first, pruned to the rolling hour.
    request_times: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, rate_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate_per_sec).min(capacity);
        self.last_refill = now;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.request_times.front() {
            if now.saturating_duration_since(oldest) >= HOUR {
                self.request_times.pop_front();
            } else {
                break;
            }
        }
        if self.blocked_until.is_some_and(|until| until <= now) {
            self.blocked_until = None;
        }
    }

    /// Oldest admission still inside the rolling minute, plus the count.
    fn minute_window(&self, now: Instant) -> (usize, Option<Instant>) {
        let mut count = 0;
        let mut oldest = None;
        for &t in self.request_times.iter().rev() {
            if now.saturating_duration_since(t) >= MINUTE {
                break;
            }
            count += 1;
            oldest = Some(t);
        }
        (count, oldest)
    }
}

/// Per-processor rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = f64::from(config.burst_limit);
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
                request_times: VecDeque::new(),
                blocked_until: None,
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.burst_limit)
    }

    fn refill_rate(&self) -> f64 {
        self.capacity() / 60.0
    }

    /// Try to admit one request. Never errors; `false` means denied.
    pub async fn acquire(&self) -> bool {
        self.acquire_many(1).await
    }

    /// Admit `n` requests as one unit, or none of them.
    ///
    /// Either all `n` tokens and window slots are taken, or the limiter is
    /// left untouched (apart from tripping the hourly block when the hour is
    /// already full).
    pub async fn acquire_many(&self, n: u32) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refill(now, self.capacity(), self.refill_rate());
        state.prune(now);

        if let Some(until) = state.blocked_until {
            debug!(wait_ms = until.duration_since(now).as_millis() as u64, "Rate limiter blocked");
            return false;
        }

        let wanted = n as usize;
        let hourly = self.config.requests_per_hour as usize;
        if state.request_times.len() >= hourly {
            let reopen = state
                .request_times
                .front()
                .map(|&oldest| oldest + HOUR)
                .unwrap_or(now);
            state.blocked_until = Some(reopen.max(now + MIN_BLOCK));
            warn!(
                limit = self.config.requests_per_hour,
                "Hourly request cap reached, blocking admissions"
            );
            return false;
        }
        if state.request_times.len() + wanted > hourly {
            debug!(requested = n, limit = hourly, "Hourly cap leaves no room");
            return false;
        }

        let (minute_count, _) = state.minute_window(now);
        if minute_count + wanted > self.config.requests_per_minute as usize {
            debug!(requested = n, limit = self.config.requests_per_minute, "Per-minute cap reached");
            return false;
        }

        let cost = f64::from(n);
        if state.tokens >= cost {
            state.tokens -= cost;
            state.request_times.extend(std::iter::repeat_n(now, wanted));
            true
        } else {
            false
        }
    }

    /// How long a caller should wait before the next `acquire()` can succeed.
    pub async fn get_wait_time(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refill(now, self.capacity(), self.refill_rate());
        state.prune(now);

        if let Some(until) = state.blocked_until {
            return until.duration_since(now);
        }

        // A zero-capacity bucket never refills.
        let token_wait = if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - state.tokens) / self.refill_rate())
                .unwrap_or(Duration::MAX)
        };

        let (minute_count, oldest) = state.minute_window(now);
        let minute_wait = match oldest {
            Some(t) if minute_count >= self.config.requests_per_minute as usize => {
                (t + MINUTE).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        };

        token_wait.max(minute_wait)
    }

    /// Tokens currently in the bucket, after refilling.
    pub async fn available_tokens(&self) -> f64 {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refill(now, self.capacity(), self.refill_rate());
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_limit: 10,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn allows_burst_then_denies() {
        let limiter = limiter();
        for _ in 0..10 {
            assert!(limiter.acquire().await);
        }
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn refills_after_time_passes() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(!limiter.acquire().await);

        // 10 tokens per minute: one token every 6 seconds.
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_burst() {
        let limiter = limiter();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.available_tokens().await, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hourly_cap_denies_even_with_tokens() {
        let limiter = limiter();
        {
            let mut state = limiter.state.lock().await;
            let now = Instant::now();
            state.request_times = std::iter::repeat_n(now, 1000).collect();
        }
        tokio::time::advance(Duration::from_secs(120)).await;

        assert!(limiter.available_tokens().await >= 1.0);
        assert!(!limiter.acquire().await);
        let wait = limiter.get_wait_time().await;
        assert!(wait > Duration::ZERO);
        assert!(wait <= HOUR);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_time_zero_when_token_available() {
        let limiter = limiter();
        assert_eq!(limiter.get_wait_time().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_time_reports_block() {
        let limiter = limiter();
        limiter.state.lock().await.blocked_until = Some(Instant::now() + Duration::from_secs(30));

        let wait = limiter.get_wait_time().await;
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(30));
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_time_reports_next_token() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        let wait = limiter.get_wait_time().await;
        assert!(wait > Duration::from_secs(5));
        assert!(wait <= Duration::from_millis(6001));
    }

    #[tokio::test(start_paused = true)]
    async fn minute_cap_applies_beyond_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 2,
            requests_per_hour: 1000,
            burst_limit: 10,
        });
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);

        tokio::time::advance(MINUTE).await;
        assert!(limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_many_is_all_or_nothing() {
        let limiter = limiter();
        assert!(limiter.acquire_many(7).await);
        assert!(!limiter.acquire_many(4).await);
        // The denied request took nothing.
        assert!(limiter.available_tokens().await >= 3.0);
        assert!(limiter.acquire_many(3).await);
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_many_respects_minute_cap() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 3,
            requests_per_hour: 1000,
            burst_limit: 10,
        });
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire_many(3).await);
        assert!(limiter.acquire_many(2).await);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_burst_waits_forever() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_limit: 0,
        });
        assert!(!limiter.acquire().await);
        assert_eq!(limiter.get_wait_time().await, Duration::MAX);
    }
}
