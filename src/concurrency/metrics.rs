//! Processing metrics shared by every entry point of the processor.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Response-time samples kept for the running average.
const MAX_RESPONSE_SAMPLES: usize = 1000;

/// Immutable snapshot of the processor's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_errors: u64,
    pub rate_limit_hits: u64,
    pub peak_concurrent_requests: usize,
    /// Mean over the most recent samples, in seconds.
    pub average_response_time: f64,
    /// Start of the current metrics epoch.
    pub since: DateTime<Utc>,
}

impl ProcessingMetrics {
    /// Successful share of finished requests, `0.0` before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}

#[derive(Debug)]
struct MetricsState {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    timeout_errors: u64,
    rate_limit_hits: u64,
    peak_concurrent_requests: usize,
    response_times: VecDeque<Duration>,
    since: DateTime<Utc>,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            timeout_errors: 0,
            rate_limit_hits: 0,
            peak_concurrent_requests: 0,
            response_times: VecDeque::with_capacity(MAX_RESPONSE_SAMPLES),
            since: Utc::now(),
        }
    }
}

/// Mutex-guarded recorder. Readers only ever get a [`ProcessingMetrics`] copy.
#[derive(Debug)]
pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MetricsState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_requests(&self, count: u64) {
        self.lock().total_requests += count;
    }

    pub fn record_success(&self, count: u64, elapsed: Duration) {
        let mut state = self.lock();
        state.successful_requests += count;
        if state.response_times.len() == MAX_RESPONSE_SAMPLES {
            state.response_times.pop_front();
        }
        state.response_times.push_back(elapsed);
    }

    pub fn record_failure(&self, count: u64) {
        self.lock().failed_requests += count;
    }

    /// `count` requests hit their deadline. Each one is a timeout and a
    /// failure, so a timed-out batch group adds its size to both counters.
    pub fn record_timeout(&self, count: u64) {
        let mut state = self.lock();
        state.timeout_errors += count;
        state.failed_requests += count;
    }

    pub fn record_rate_limit_hit(&self) {
        self.lock().rate_limit_hits += 1;
    }

    /// Raise the peak if `in_flight` is a new high.
    pub fn observe_concurrency(&self, in_flight: usize) {
        let mut state = self.lock();
        state.peak_concurrent_requests = state.peak_concurrent_requests.max(in_flight);
    }

    pub fn snapshot(&self) -> ProcessingMetrics {
        let state = self.lock();
        let average_response_time = if state.response_times.is_empty() {
            0.0
        } else {
            let total: Duration = state.response_times.iter().sum();
            total.as_secs_f64() / state.response_times.len() as f64
        };
        ProcessingMetrics {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            timeout_errors: state.timeout_errors,
            rate_limit_hits: state.rate_limit_hits,
            peak_concurrent_requests: state.peak_concurrent_requests,
            average_response_time,
            since: state.since,
        }
    }

    /// Start a new epoch with zeroed counters.
    pub fn reset(&self) {
        *self.lock() = MetricsState::new();
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_snapshot_is_zero() {
        let metrics = MetricsRecorder::new().snapshot();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.successful_requests, 0);
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.average_response_time, 0.0);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn average_response_time() {
        let recorder = MetricsRecorder::new();
        recorder.record_requests(2);
        recorder.record_success(1, Duration::from_millis(100));
        recorder.record_success(1, Duration::from_millis(300));

        let metrics = recorder.snapshot();
        assert!((metrics.average_response_time - 0.2).abs() < 1e-9);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    #[test]
    fn response_samples_are_bounded() {
        let recorder = MetricsRecorder::new();
        for _ in 0..MAX_RESPONSE_SAMPLES {
            recorder.record_success(1, Duration::from_secs(10));
        }
        for _ in 0..MAX_RESPONSE_SAMPLES {
            recorder.record_success(1, Duration::from_secs(1));
        }
        let metrics = recorder.snapshot();
        assert!((metrics.average_response_time - 1.0).abs() < 1e-9);
        assert_eq!(metrics.successful_requests, 2 * MAX_RESPONSE_SAMPLES as u64);
    }

    #[test]
    fn peak_never_decreases() {
        let recorder = MetricsRecorder::new();
        recorder.observe_concurrency(4);
        recorder.observe_concurrency(2);
        assert_eq!(recorder.snapshot().peak_concurrent_requests, 4);

        recorder.reset();
        assert_eq!(recorder.snapshot().peak_concurrent_requests, 0);
    }

    #[test]
    fn timeout_counts_as_failure() {
        let recorder = MetricsRecorder::new();
        recorder.record_timeout(1);
        let metrics = recorder.snapshot();
        assert_eq!(metrics.timeout_errors, 1);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[test]
    fn grouped_timeout_counts_every_request() {
        let recorder = MetricsRecorder::new();
        recorder.record_requests(3);
        recorder.record_timeout(3);
        let metrics = recorder.snapshot();
        assert_eq!(metrics.timeout_errors, 3);
        assert_eq!(metrics.failed_requests, 3);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn snapshot_is_detached() {
        let recorder = MetricsRecorder::new();
        let before = recorder.snapshot();
        recorder.record_rate_limit_hit();
        assert_eq!(before.rate_limit_hits, 0);
        assert_eq!(recorder.snapshot().rate_limit_hits, 1);
    }
}
