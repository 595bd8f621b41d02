//! Admission control and scheduling for every agent invocation and LLM call.
//!
//! A unit of work passes, in order: the rate limiter, the global semaphore,
//! the per-agent (or per-provider) semaphore, then runs under the request
//! deadline. Permits are RAII guards, so they are released in reverse
//! acquisition order on every exit path, including cancellation.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::concurrency::metrics::{MetricsRecorder, ProcessingMetrics};
use crate::concurrency::pool::{ConnectionPool, ManagedPool, PoolConnection, PoolStats};
use crate::concurrency::rate_limiter::RateLimiter;
use crate::config::{ConcurrencyConfig, RateLimitConfig};
use crate::error::{ConcurrencyError, Error, PoolError, Result};

type PoolMap = Arc<RwLock<HashMap<String, Arc<dyn ManagedPool>>>>;

/// Which secondary cap a unit of work is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Agent,
    Provider,
}

impl Scope {
    fn label(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Provider => "provider",
        }
    }
}

/// Increments a gauge for as long as it lives.
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> (Self, usize) {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(gauge), now)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Permits held by an admitted unit of work. Fields drop top to bottom:
/// the in-flight gauge first, then the secondary permit, then the global one.
struct Admission<'a> {
    _in_flight: GaugeGuard<'a>,
    _secondary: Option<OwnedSemaphorePermit>,
    _global: OwnedSemaphorePermit,
}

/// Observability snapshot for dashboards and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
    pub running: bool,
    pub active_requests: usize,
    pub queued_requests: usize,
    pub max_concurrent_requests: usize,
    pub available_permits: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_errors: u64,
    pub rate_limit_hits: u64,
    pub peak_concurrent_requests: usize,
    pub success_rate: f64,
    pub average_response_time: f64,
    pub tracked_agents: usize,
    pub tracked_providers: usize,
    pub connection_pools: BTreeMap<String, PoolStats>,
}

/// Shared resource-governance point for the whole process.
pub struct ConcurrentProcessor {
    config: ConcurrencyConfig,
    rate_limiter: RateLimiter,
    global: Arc<Semaphore>,
    agent_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    provider_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    pools: PoolMap,
    metrics: MetricsRecorder,
    active: AtomicUsize,
    queued: AtomicUsize,
    background: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ConcurrentProcessor {
    /// Create a processor. Limits are validated up front.
    pub fn new(config: ConcurrencyConfig, rate_limit: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        rate_limit.validate()?;

        Ok(Self {
            global: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            rate_limiter: RateLimiter::new(rate_limit),
            config,
            agent_semaphores: Mutex::new(HashMap::new()),
            provider_semaphores: Mutex::new(HashMap::new()),
            pools: Arc::new(RwLock::new(HashMap::new())),
            metrics: MetricsRecorder::new(),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            background: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Spawn background maintenance. Calling it twice is a no-op, and a
    /// stopped processor cannot be restarted.
    pub async fn start(&self) {
        if self.global.is_closed() {
            warn!("Concurrent processor already stopped, not restarting");
            return;
        }
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return;
        }
        background.push(spawn_pool_sweeper(
            Arc::clone(&self.pools),
            self.config.pool_sweep_interval,
        ));
        info!(
            max_concurrent = self.config.max_concurrent_requests,
            per_agent = self.config.max_concurrent_per_agent,
            per_provider = self.config.max_concurrent_per_llm_provider,
            "Concurrent processor started"
        );
    }

    /// Stop admitting work, cancel and join background maintenance, then
    /// close every pool.
    ///
    /// Work already holding permits runs to completion. Anything arriving
    /// afterwards, or still queued for a permit, fails with
    /// [`ConcurrencyError::ShutDown`].
    pub async fn stop(&self) {
        self.global.close();
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            handle.abort();
            // A cancelled JoinError is the expected outcome here.
            let _ = handle.await;
        }

        for pool in self.pool_handles() {
            pool.close_all().await;
        }
        info!("Concurrent processor stopped");
    }

    pub async fn is_running(&self) -> bool {
        !self.background.lock().await.is_empty()
    }

    pub async fn background_task_count(&self) -> usize {
        self.background.lock().await.len()
    }

    /// Run a unit of work attributed to `agent_name`.
    ///
    /// Errors returned by `func` are counted and passed through unchanged.
    pub async fn process_request<T, F, Fut>(
        &self,
        request_id: &str,
        agent_name: &str,
        func: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_gated(request_id, Scope::Agent, agent_name, func)
            .await
    }

    /// Run an LLM call, gated on the provider's concurrency cap.
    ///
    /// Circuit breaking is the caller's concern; wrap this call in the
    /// resilience layer's breaker for `provider_name`.
    pub async fn process_llm_request<T, F, Fut>(
        &self,
        request_id: &str,
        provider_name: &str,
        func: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_gated(request_id, Scope::Provider, provider_name, func)
            .await
    }

    async fn run_gated<T, F, Fut>(
        &self,
        request_id: &str,
        scope: Scope,
        name: &str,
        func: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.metrics.record_requests(1);
        self.admit(request_id, 1).await?;

        let secondary = self.scoped_semaphore(scope, name);
        let _admission = self.acquire_permits(Some(secondary)).await?;

        debug!(
            request_id = %request_id,
            scope = scope.label(),
            name = %name,
            "Processing request"
        );

        let started = Instant::now();
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, func()).await {
            Ok(Ok(value)) => {
                self.metrics.record_success(1, started.elapsed());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.metrics.record_failure(1);
                debug!(request_id = %request_id, error = %e, "Request failed");
                Err(e)
            }
            Err(_) => {
                self.metrics.record_timeout(1);
                warn!(request_id = %request_id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(ConcurrencyError::Timeout {
                    request_id: request_id.to_string(),
                    timeout,
                }
                .into())
            }
        }
    }

    /// Shutdown and rate-limit gate shared by every entry point. `cost`
    /// tokens are taken together or not at all.
    async fn admit(&self, request_id: &str, cost: u32) -> Result<()> {
        if self.global.is_closed() {
            debug!(request_id = %request_id, "Rejected after shutdown");
            return Err(ConcurrencyError::ShutDown.into());
        }
        if self.rate_limiter.acquire_many(cost).await {
            return Ok(());
        }
        self.metrics.record_rate_limit_hit();
        let retry_after = self.rate_limiter.get_wait_time().await;
        warn!(
            request_id = %request_id,
            retry_after_ms = retry_after.as_millis() as u64,
            "Request rate limited"
        );
        Err(ConcurrencyError::RateLimited {
            request_id: request_id.to_string(),
            retry_after,
        }
        .into())
    }

    async fn acquire_permits(&self, secondary: Option<Arc<Semaphore>>) -> Result<Admission<'_>> {
        let (waiting, _) = GaugeGuard::enter(&self.queued);

        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| ConcurrencyError::ShutDown)?;
        let secondary = match secondary {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ConcurrencyError::ShutDown)?,
            ),
            None => None,
        };
        drop(waiting);

        let (in_flight, now) = GaugeGuard::enter(&self.active);
        self.metrics.observe_concurrency(now);

        Ok(Admission {
            _in_flight: in_flight,
            _secondary: secondary,
            _global: global,
        })
    }

    /// Get or lazily create the semaphore for `name`, capped at the global limit.
    fn scoped_semaphore(&self, scope: Scope, name: &str) -> Arc<Semaphore> {
        let (map, cap) = match scope {
            Scope::Agent => (&self.agent_semaphores, self.config.max_concurrent_per_agent),
            Scope::Provider => (
                &self.provider_semaphores,
                self.config.max_concurrent_per_llm_provider,
            ),
        };
        let permits = cap.min(self.config.max_concurrent_requests);
        let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits))),
        )
    }

    /// Process `(request_id, input)` pairs through `batch_fn`, one call per group.
    ///
    /// With batching enabled, inputs are grouped into chunks of `batch_size`;
    /// otherwise everything goes in one group. The whole batch is admitted up
    /// front, one rate-limit token per group, so a denied batch never reaches
    /// `batch_fn`. Groups then run concurrently, each under one global permit
    /// and the batch deadline. Results come back in input order.
    pub async fn batch_process<I, T, B, Fut>(
        &self,
        requests: Vec<(String, I)>,
        batch_fn: B,
    ) -> Result<Vec<T>>
    where
        B: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let group_size = if self.config.enable_request_batching {
            self.config.batch_size
        } else {
            requests.len()
        };

        let mut groups: Vec<(Vec<String>, Vec<I>)> = Vec::new();
        for (request_id, input) in requests {
            if groups.last().is_none_or(|(ids, _)| ids.len() >= group_size) {
                groups.push((Vec::with_capacity(group_size), Vec::with_capacity(group_size)));
            }
            if let Some((ids, inputs)) = groups.last_mut() {
                ids.push(request_id);
                inputs.push(input);
            }
        }

        let total: usize = groups.iter().map(|(ids, _)| ids.len()).sum();
        self.metrics.record_requests(total as u64);
        let batch_id = span_id(
            groups.first().map(|(ids, _)| ids.as_slice()),
            groups.last().map(|(ids, _)| ids.as_slice()),
        );
        let cost = u32::try_from(groups.len()).unwrap_or(u32::MAX);
        self.admit(&batch_id, cost).await?;

        debug!(groups = groups.len(), group_size, "Dispatching batch");

        let outcomes = futures::future::join_all(
            groups
                .into_iter()
                .map(|(ids, inputs)| self.run_batch_group(ids, inputs, &batch_fn)),
        )
        .await;

        let mut results = Vec::new();
        for outcome in outcomes {
            results.extend(outcome?);
        }
        Ok(results)
    }

    async fn run_batch_group<I, T, B, Fut>(
        &self,
        ids: Vec<String>,
        inputs: Vec<I>,
        batch_fn: &B,
    ) -> Result<Vec<T>>
    where
        B: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let expected = ids.len();
        let count = expected as u64;
        let batch_id = span_id(Some(ids.as_slice()), Some(ids.as_slice()));

        let _admission = self.acquire_permits(None).await?;

        let started = Instant::now();
        let timeout = self.config.batch_timeout;
        match tokio::time::timeout(timeout, batch_fn(inputs)).await {
            Ok(Ok(results)) if results.len() == expected => {
                self.metrics.record_success(count, started.elapsed());
                Ok(results)
            }
            Ok(Ok(results)) => {
                self.metrics.record_failure(count);
                Err(ConcurrencyError::BatchSizeMismatch {
                    expected,
                    actual: results.len(),
                }
                .into())
            }
            Ok(Err(e)) => {
                self.metrics.record_failure(count);
                debug!(batch = %batch_id, error = %e, "Batch failed");
                Err(e)
            }
            Err(_) => {
                self.metrics.record_timeout(count);
                warn!(batch = %batch_id, "Batch timed out");
                Err(ConcurrencyError::Timeout {
                    request_id: batch_id,
                    timeout,
                }
                .into())
            }
        }
    }

    /// Return the named pool, creating it on first use.
    ///
    /// `factory` and `max_size` are only used when the pool does not exist yet.
    pub fn get_connection_pool<C, F, Fut>(
        &self,
        name: &str,
        factory: F,
        max_size: usize,
    ) -> Result<Arc<ConnectionPool<C>>>
    where
        C: PoolConnection,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = pools.get(name) {
            return Arc::clone(existing)
                .into_any()
                .downcast::<ConnectionPool<C>>()
                .map_err(|_| {
                    Error::Pool(PoolError::TypeMismatch {
                        pool: name.to_string(),
                    })
                });
        }

        let pool = Arc::new(ConnectionPool::new(name, max_size, factory));
        pools.insert(name.to_string(), Arc::clone(&pool) as Arc<dyn ManagedPool>);
        debug!(pool = %name, max_size, "Created connection pool");
        Ok(pool)
    }

    fn pool_handles(&self) -> Vec<Arc<dyn ManagedPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get_metrics(&self) -> ProcessingMetrics {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn get_status(&self) -> ProcessorStatus {
        let metrics = self.metrics.snapshot();
        let connection_pools = self
            .pool_handles()
            .into_iter()
            .map(|pool| {
                let stats = pool.stats();
                (stats.name.clone(), stats)
            })
            .collect();
        let tracked = |map: &Mutex<HashMap<String, Arc<Semaphore>>>| {
            map.lock().unwrap_or_else(PoisonError::into_inner).len()
        };

        ProcessorStatus {
            running: self
                .background
                .try_lock()
                .map(|b| !b.is_empty())
                .unwrap_or(true),
            active_requests: self.active.load(Ordering::SeqCst),
            queued_requests: self.queued.load(Ordering::SeqCst),
            max_concurrent_requests: self.config.max_concurrent_requests,
            available_permits: self.global.available_permits(),
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            timeout_errors: metrics.timeout_errors,
            rate_limit_hits: metrics.rate_limit_hits,
            peak_concurrent_requests: metrics.peak_concurrent_requests,
            success_rate: metrics.success_rate(),
            average_response_time: metrics.average_response_time,
            tracked_agents: tracked(&self.agent_semaphores),
            tracked_providers: tracked(&self.provider_semaphores),
            connection_pools,
        }
    }
}

/// `first..last` over the request ids spanned by one or more groups.
fn span_id(first: Option<&[String]>, last: Option<&[String]>) -> String {
    let first = first.and_then(|ids| ids.first());
    let last = last.and_then(|ids| ids.last());
    match (first, last) {
        (Some(first), Some(last)) if first != last => format!("{first}..{last}"),
        (Some(first), _) => first.clone(),
        _ => String::new(),
    }
}

/// Periodically evict idle connections from every registered pool.
fn spawn_pool_sweeper(pools: PoolMap, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let handles: Vec<Arc<dyn ManagedPool>> = pools
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned()
                .collect();
            let mut evicted = 0;
            for pool in handles {
                evicted += pool.evict_idle().await;
            }
            if evicted > 0 {
                debug!(evicted, "Idle connection sweep");
            }
        }
    })
}
