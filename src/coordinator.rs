//! Coordinator Facade: the single entry point callers use.
//!
//! A submission flows through the cache, then the per-bucket circuit breakers, then the quota
//! ledger. A request that passes all three runs before `submit` returns; anything else is queued
//! and picked up by its group's drain worker once quota and breakers allow.
//!
//! ```rust
//! use ratewarden::{Coordinator, CoordinatorConfig, Priority};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config =
//!     CoordinatorConfig::default().with_bucket("summonerLookup", 20, Duration::from_secs(1));
//! let coordinator = Coordinator::<String, String>::new(config).unwrap();
//!
//! let handle = coordinator
//!     .submit("summoner:faker", ["summonerLookup"], Priority::Interactive, || async {
//!         Ok("Faker".to_string())
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(handle.wait().await.unwrap(), "Faker");
//! # }
//! ```

use crate::backoff::RetryBackoff;
use crate::cache::{CacheLayer, CacheStats, InMemorySharedTier, Lookup, SharedTier};
use crate::circuit_breaker::{CircuitState, CircuitStatus};
use crate::circuit_breaker_registry::CircuitRegistry;
use crate::clock::{millis, Clock, TokioClock};
use crate::completion::{CompletionHandle, CompletionSlot, Outcome};
use crate::config::{BucketConfig, CoordinatorConfig};
use crate::error::{ConfigError, CoordinatorError};
use crate::hot_keys::HotKeyTracker;
use crate::quota::{BucketLimits, Decision, QuotaLedger, QuotaStatus};
use crate::scheduler::{
    group_key, AdmissionQueue, Gate, GroupKey, Priority, QueuedRequest, RequestId, Withdrawn,
};
use crate::telemetry::{
    CacheTier, CircuitEvent, CoordinatorEvent, Emitter, HotKeyEvent, NullSink, QuotaEvent,
    RequestEvent, TelemetrySink,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};

/// Deferred upstream call. Invoked once per attempt.
pub type ExecuteFn<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// A submission with its options.
pub struct Request<T, E> {
    key: String,
    buckets: Vec<String>,
    execute: ExecuteFn<T, E>,
    priority: Priority,
    cache_ttl: Option<Duration>,
    no_cache: bool,
    bypass_cache: bool,
    max_age: Option<Duration>,
}

impl<T, E> Request<T, E> {
    pub fn new<B, S, F, Fut>(key: impl Into<String>, buckets: B, execute: F) -> Self
    where
        B: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_fn(key, buckets, Arc::new(move || execute().boxed()))
    }

    pub fn from_fn<B, S>(key: impl Into<String>, buckets: B, execute: ExecuteFn<T, E>) -> Self
    where
        B: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            buckets: buckets.into_iter().map(Into::into).collect(),
            execute,
            priority: Priority::Interactive,
            cache_ttl: None,
            no_cache: false,
            bypass_cache: false,
            max_age: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Cache the result for `ttl` instead of the configured default.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Do not store the result.
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Skip the cache read and always go upstream. The access is not counted as a miss.
    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    /// Queue deadline for this request instead of `queue.max_age`.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn buckets(&self) -> &[String] {
        &self.buckets
    }
}

impl<T, E> fmt::Debug for Request<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("key", &self.key)
            .field("buckets", &self.buckets)
            .field("priority", &self.priority)
            .field("cache_ttl", &self.cache_ttl)
            .field("no_cache", &self.no_cache)
            .field("bypass_cache", &self.bypass_cache)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

struct Job<T, E> {
    execute: ExecuteFn<T, E>,
    slot: Arc<CompletionSlot<T, E>>,
    cache_ttl: Duration,
    no_cache: bool,
}

impl<T, E> fmt::Debug for Job<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("slot", &self.slot).finish_non_exhaustive()
    }
}

impl<T, E> Withdrawn for Job<T, E> {
    fn is_withdrawn(&self) -> bool {
        self.slot.is_cancelled() || self.slot.is_resolved() || self.slot.is_abandoned()
    }
}

struct PendingEntry<T, E> {
    slot: Arc<CompletionSlot<T, E>>,
    group: GroupKey,
}

/// Recurring re-fetch for a promoted key.
struct RefreshJob<T, E> {
    buckets: GroupKey,
    execute: ExecuteFn<T, E>,
    in_flight: Option<CompletionHandle<T, E>>,
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder<T, E> {
    config: CoordinatorConfig,
    clock: Option<Arc<dyn Clock>>,
    shared: Option<Arc<dyn SharedTier<T>>>,
    emitter: Option<Emitter>,
    workers: bool,
    _error: std::marker::PhantomData<fn() -> E>,
}

impl<T, E> CoordinatorBuilder<T, E>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Clock driving every window, deadline, and cooldown. Defaults to [`TokioClock`].
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Shared cache tier. Defaults to an in-process [`InMemorySharedTier`].
    pub fn shared_tier(mut self, shared: Arc<dyn SharedTier<T>>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.emitter = Some(Emitter::new(sink));
        self
    }

    /// Spawn no background workers; drive the coordinator with
    /// [`Coordinator::run_maintenance`] and [`Coordinator::drain_now`].
    pub fn manual(mut self) -> Self {
        self.workers = false;
        self
    }

    pub fn build(self) -> Result<Coordinator<T, E>, ConfigError> {
        let config = self.config;
        config.validate()?;
        let runtime = if self.workers {
            Some(Handle::try_current().map_err(|_| ConfigError::RuntimeUnavailable)?)
        } else {
            None
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock::default()));
        let ledger = QuotaLedger::with_buckets(clock.clone(), &config.buckets)?;
        let tracker = Arc::new(HotKeyTracker::new(config.hot_keys.clone(), clock.clone()));
        let shared = self.shared.unwrap_or_else(|| Arc::new(InMemorySharedTier::new()));
        let cache = CacheLayer::new(&config.cache, shared, clock.clone())
            .with_miss_observer(tracker.clone());
        let breakers = CircuitRegistry::new(config.circuit.clone(), clock.clone());
        for bucket in &config.buckets {
            breakers.register(&bucket.name);
        }
        let queue = AdmissionQueue::new(
            config.queue.max_size_per_tier,
            config.queue.max_attempts,
            config.queue.circuit_backoff,
        );
        let backoff = RetryBackoff::from_config(&config.queue)?;
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            clock,
            ledger,
            cache,
            tracker,
            breakers,
            queue,
            backoff,
            pending: DashMap::new(),
            refreshers: Mutex::new(HashMap::new()),
            emitter: self.emitter.unwrap_or_else(|| Emitter::new(NullSink)),
            next_id: AtomicU64::new(1),
            drainers: Mutex::new(HashSet::new()),
            shutdown,
            closed: AtomicBool::new(false),
            runtime,
            config,
        });
        if let Some(handle) = &inner.runtime {
            handle.spawn(hot_key_worker(
                Arc::downgrade(&inner),
                inner.shutdown.subscribe(),
                inner.config.hot_keys.tick,
            ));
            handle.spawn(circuit_worker(
                Arc::downgrade(&inner),
                inner.shutdown.subscribe(),
                inner.config.circuit.probe_tick,
            ));
        }
        tracing::info!(
            buckets = inner.config.buckets.len(),
            workers = inner.runtime.is_some(),
            "coordinator started"
        );
        Ok(Coordinator { inner })
    }
}

/// Rate-governed access to one upstream.
///
/// Cheap to clone. Dropping the last clone shuts the coordinator down.
pub struct Coordinator<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Coordinator<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> fmt::Debug for Coordinator<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("buckets", &self.inner.ledger.bucket_names())
            .field("queue", &self.inner.queue)
            .field("workers", &self.inner.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl<T, E> Coordinator<T, E>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Build with defaults and background workers. Must be called inside a tokio runtime.
    pub fn new(config: CoordinatorConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: CoordinatorConfig) -> CoordinatorBuilder<T, E> {
        CoordinatorBuilder {
            config,
            clock: None,
            shared: None,
            emitter: None,
            workers: true,
            _error: std::marker::PhantomData,
        }
    }

    /// Submit `execute` for `key`, gated by every bucket in `buckets`.
    ///
    /// Returns `Err` only for [`CoordinatorError::QueueFull`] and
    /// [`CoordinatorError::InvalidRequest`]; every other outcome arrives through the handle.
    pub async fn submit<B, S, F, Fut>(
        &self,
        key: impl Into<String>,
        buckets: B,
        priority: Priority,
        execute: F,
    ) -> Result<CompletionHandle<T, E>, CoordinatorError<E>>
    where
        B: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.submit_request(Request::new(key, buckets, execute).priority(priority)).await
    }

    pub async fn submit_request(
        &self,
        request: Request<T, E>,
    ) -> Result<CompletionHandle<T, E>, CoordinatorError<E>> {
        self.inner.submit(request).await
    }

    /// Cancel a queued request. Returns `false` if it is unknown or already finished.
    pub fn cancel(&self, id: RequestId) -> bool {
        let Some((_, entry)) = self.inner.pending.remove(&id) else {
            return false;
        };
        let queued = self.inner.queue.remove(&entry.group, id);
        let cancelled = entry.slot.cancel();
        if cancelled {
            tracing::debug!(request = %id, "request cancelled");
            if let Some(request) = queued {
                self.inner.emit(RequestEvent::Cancelled { id, key: request.key });
            }
        }
        cancelled
    }

    pub fn get_quota_status(&self, bucket: &str) -> Option<QuotaStatus> {
        self.inner.ledger.status(bucket)
    }

    pub fn get_circuit_status(&self, bucket: &str) -> Option<CircuitState> {
        self.inner.breakers.state(bucket)
    }

    /// Breaker state with failure count and open time.
    pub fn circuit_details(&self, bucket: &str) -> Option<CircuitStatus> {
        self.inner.breakers.status(bucket)
    }

    /// Change a bucket's limits without resetting its window.
    pub fn set_bucket_limits(
        &self,
        bucket: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<(), ConfigError> {
        self.inner.ledger.set_limits(bucket, BucketLimits { max_requests, window })
    }

    /// Register a bucket (and its breaker) at runtime. An existing bucket is replaced.
    pub fn add_bucket(&self, bucket: BucketConfig) -> Result<(), ConfigError> {
        self.inner.ledger.register(&bucket)?;
        self.inner.breakers.register(&bucket.name);
        Ok(())
    }

    pub fn queue_depth(&self, priority: Priority) -> usize {
        self.inner.queue.depth(priority)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_promoted(&self, key: &str) -> bool {
        self.inner.tracker.is_promoted(key)
    }

    /// Keys with a recurring refresh job, sorted.
    pub fn scheduled_refreshes(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock_refreshers().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.cache.invalidate(key).await;
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// One round of background work run inline: breaker probes, hot-key rollover and refreshes,
    /// then a drain of every group. Returns how many queued requests were admitted.
    pub async fn run_maintenance(&self) -> usize {
        self.inner.circuit_tick();
        self.inner.hot_key_tick(true).await;
        self.drain_now().await
    }

    /// Drain every group once, running admitted requests inline and in order.
    pub async fn drain_now(&self) -> usize {
        let mut admitted = 0;
        for group in self.inner.queue.group_keys() {
            admitted += self.inner.drain_group(&group, true).await;
        }
        admitted
    }

    /// Stop background workers and resolve every queued request as `Cancelled`.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

struct Inner<T, E> {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    ledger: QuotaLedger,
    cache: CacheLayer<T>,
    tracker: Arc<HotKeyTracker>,
    breakers: CircuitRegistry,
    queue: AdmissionQueue<Job<T, E>>,
    backoff: RetryBackoff,
    pending: DashMap<RequestId, PendingEntry<T, E>>,
    refreshers: Mutex<HashMap<String, RefreshJob<T, E>>>,
    emitter: Emitter,
    next_id: AtomicU64,
    drainers: Mutex<HashSet<GroupKey>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    runtime: Option<Handle>,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn submit(
        self: &Arc<Self>,
        request: Request<T, E>,
    ) -> Result<CompletionHandle<T, E>, CoordinatorError<E>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoordinatorError::InvalidRequest {
                reason: "coordinator is shut down".to_string(),
            });
        }
        let group = self.validate_buckets(&request.buckets)?;
        let id = RequestId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (slot, handle) = CompletionSlot::new(id);

        if !request.bypass_cache {
            let (value, tier) = match self.cache.lookup(&request.key).await {
                Lookup::Local(value) => (value, CacheTier::Local),
                Lookup::Shared(value) => (value, CacheTier::Shared),
                Lookup::Miss => {
                    self.track_refresh(&request, &group);
                    return self.admit_or_queue(id, request, group, slot, handle).await;
                }
            };
            self.tracker.record_hit(&request.key);
            tracing::trace!(key = %request.key, %tier, "served from cache");
            self.emit(RequestEvent::CacheHit { key: request.key, tier });
            slot.resolve(Ok(value));
            return Ok(handle);
        }
        self.admit_or_queue(id, request, group, slot, handle).await
    }

    async fn admit_or_queue(
        self: &Arc<Self>,
        id: RequestId,
        request: Request<T, E>,
        group: GroupKey,
        slot: Arc<CompletionSlot<T, E>>,
        handle: CompletionHandle<T, E>,
    ) -> Result<CompletionHandle<T, E>, CoordinatorError<E>> {
        let cache_ttl = request.cache_ttl.unwrap_or(self.config.cache.default_ttl);
        let job = Job { execute: request.execute, slot, cache_ttl, no_cache: request.no_cache };
        let queued = QueuedRequest::new(
            id,
            request.key,
            group.clone(),
            request.priority,
            self.clock.now_millis(),
            request.max_age.unwrap_or(self.config.queue.max_age),
            job,
        );

        // Anything already waiting on one of these buckets at this tier or above goes first.
        let waiting = self.queue.has_waiting_ahead(&group[..], queued.priority);
        if !waiting && self.gate(&queued) == Gate::Admit {
            self.execute(queued).await;
            return Ok(handle);
        }
        self.enqueue(queued)?;
        Ok(handle)
    }

    fn validate_buckets(&self, buckets: &[String]) -> Result<GroupKey, CoordinatorError<E>> {
        if buckets.is_empty() {
            return Err(CoordinatorError::InvalidRequest {
                reason: "request names no quota buckets".to_string(),
            });
        }
        if let Some(unknown) = buckets.iter().find(|name| !self.ledger.contains(name)) {
            return Err(CoordinatorError::InvalidRequest {
                reason: format!("unknown quota bucket '{}'", unknown),
            });
        }
        Ok(group_key(buckets))
    }

    /// Register a recurring refresh once the tracker has promoted `request.key`.
    fn track_refresh(&self, request: &Request<T, E>, group: &GroupKey) {
        if !self.tracker.is_promoted(&request.key) {
            return;
        }
        let mut refreshers = self.lock_refreshers();
        if refreshers.contains_key(&request.key) {
            return;
        }
        let job = RefreshJob {
            buckets: group.clone(),
            execute: request.execute.clone(),
            in_flight: None,
        };
        refreshers.insert(request.key.clone(), job);
        drop(refreshers);
        tracing::debug!(key = %request.key, "refresh job registered");
        self.emit(HotKeyEvent::Promoted { key: request.key.clone() });
    }

    /// Breakers first, then quota. Trial slots are handed back if quota says no.
    fn gate(&self, request: &QueuedRequest<Job<T, E>>) -> Gate {
        let buckets = &request.group[..];
        let ticket = match self.breakers.acquire(buckets) {
            Ok(ticket) => ticket,
            Err(denied) => {
                tracing::debug!(request = %request.id, bucket = %denied.bucket, "circuit open");
                return Gate::CircuitOpen;
            }
        };
        match self.ledger.acquire(buckets) {
            Decision::Allowed { .. } => {
                drop(ticket);
                Gate::Admit
            }
            Decision::Denied { bucket, wait } => {
                self.breakers.release(ticket);
                self.emit(QuotaEvent::Denied { bucket, wait });
                Gate::QuotaExhausted { wait }
            }
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        request: QueuedRequest<Job<T, E>>,
    ) -> Result<(), CoordinatorError<E>> {
        let id = request.id;
        let key = request.key.clone();
        let group = request.group.clone();
        let priority = request.priority;
        let entry = PendingEntry { slot: request.payload.slot.clone(), group: group.clone() };
        self.pending.insert(id, entry);
        match self.queue.enqueue(request) {
            Ok(()) => {
                tracing::debug!(request = %id, key = %key, %priority, "request queued");
                self.emit(RequestEvent::Queued { id, key, priority });
                self.ensure_drainer(&group);
                Ok(())
            }
            Err(rejected) => {
                self.pending.remove(&id);
                tracing::warn!(
                    key = %key,
                    %priority,
                    full_tier = %rejected.tier,
                    capacity = rejected.capacity,
                    "admission queue full; request rejected"
                );
                self.emit(RequestEvent::Rejected { key, priority });
                Err(CoordinatorError::QueueFull {
                    priority: rejected.tier,
                    capacity: rejected.capacity,
                })
            }
        }
    }

    async fn execute(self: &Arc<Self>, mut request: QueuedRequest<Job<T, E>>) {
        request.attempts += 1;
        let result = (request.payload.execute)().await;
        let now = self.clock.now_millis();
        match result {
            Ok(value) => {
                self.record_outcome(&request.group, true);
                if !request.payload.no_cache {
                    self.cache.put(&request.key, value.clone(), request.payload.cache_ttl).await;
                }
                tracing::debug!(
                    request = %request.id,
                    key = %request.key,
                    attempts = request.attempts,
                    "request executed"
                );
                self.emit(RequestEvent::Executed {
                    id: request.id,
                    key: request.key.clone(),
                    attempts: request.attempts,
                    queued_for: request.waited(now),
                });
                self.settle(&request, Ok(value));
            }
            Err(error) => {
                self.record_outcome(&request.group, false);
                let attempts = request.attempts;
                let will_retry = attempts < self.config.queue.max_attempts
                    && !request.payload.slot.is_cancelled()
                    && !self.closed.load(Ordering::Acquire);
                tracing::debug!(
                    request = %request.id,
                    key = %request.key,
                    attempts,
                    will_retry,
                    "upstream call failed"
                );
                self.emit(RequestEvent::Failed {
                    id: request.id,
                    key: request.key.clone(),
                    attempts,
                    will_retry,
                });
                if !will_retry {
                    self.settle(&request, Err(CoordinatorError::Upstream { error, attempts }));
                    return;
                }
                request.not_before = now.saturating_add(millis(self.backoff.next_delay(attempts)));
                let slot = request.payload.slot.clone();
                let id = request.id;
                if self.enqueue(request).is_err() {
                    self.pending.remove(&id);
                    slot.resolve(Err(CoordinatorError::Upstream { error, attempts }));
                }
            }
        }
    }

    fn settle(&self, request: &QueuedRequest<Job<T, E>>, outcome: Outcome<T, E>) {
        self.pending.remove(&request.id);
        request.payload.slot.resolve(outcome);
    }

    fn record_outcome(&self, group: &GroupKey, success: bool) {
        for (bucket, state) in self.breakers.record(&group[..], success) {
            match state {
                CircuitState::Open => {
                    let failures =
                        self.breakers.status(&bucket).map_or(0, |s| s.consecutive_failures);
                    self.emit(CircuitEvent::Opened { bucket, failures });
                }
                CircuitState::Closed => {
                    self.queue.clear_circuit_backoff(&bucket);
                    self.emit(CircuitEvent::Closed { bucket });
                }
                CircuitState::HalfOpen => self.emit(CircuitEvent::HalfOpen { bucket }),
            }
        }
    }

    /// One drain pass over `group`. Admitted requests run inline when `inline` is set, otherwise
    /// each is spawned onto the runtime.
    async fn drain_group(self: &Arc<Self>, group: &GroupKey, inline: bool) -> usize {
        let now = self.clock.now_millis();
        let pass = self.queue.drain(group, now, |request| self.gate(request));

        for request in pass.withdrawn {
            self.pending.remove(&request.id);
            request.payload.slot.resolve(Err(CoordinatorError::Cancelled));
            tracing::debug!(request = %request.id, key = %request.key, "withdrawn request dropped");
            self.emit(RequestEvent::Cancelled { id: request.id, key: request.key.clone() });
        }
        for request in pass.expired {
            let waited = request.waited(now);
            tracing::warn!(
                request = %request.id,
                key = %request.key,
                ?waited,
                attempts = request.attempts,
                "queued request expired"
            );
            self.emit(RequestEvent::Expired { id: request.id, key: request.key.clone(), waited });
            let attempts = request.attempts;
            self.settle(&request, Err(CoordinatorError::Expired { waited, attempts }));
        }

        let admitted = pass.admitted.len();
        for request in pass.admitted {
            match (&self.runtime, inline) {
                (Some(handle), false) => {
                    let inner = self.clone();
                    handle.spawn(async move { inner.execute(request).await });
                }
                _ => self.execute(request).await,
            }
        }
        admitted
    }

    fn ensure_drainer(self: &Arc<Self>, group: &GroupKey) {
        let Some(handle) = &self.runtime else {
            return;
        };
        let mut drainers = self.drainers.lock().unwrap_or_else(PoisonError::into_inner);
        if !drainers.insert(group.clone()) {
            return;
        }
        handle.spawn(drain_worker(
            Arc::downgrade(self),
            group.clone(),
            self.queue.notifier(group),
            self.shutdown.subscribe(),
            self.config.queue.drain_tick,
        ));
    }

    /// Roll hot-key windows, drop refresh jobs of demoted keys, submit due refreshes, and purge
    /// expired cache entries.
    async fn hot_key_tick(self: &Arc<Self>, inline: bool) {
        let tick = self.tracker.tick();
        if !tick.demoted.is_empty() {
            let mut refreshers = self.lock_refreshers();
            for key in &tick.demoted {
                refreshers.remove(key);
            }
        }
        for key in tick.demoted {
            self.emit(HotKeyEvent::Demoted { key });
        }
        for task in tick.refreshes {
            match (&self.runtime, inline) {
                (Some(handle), false) => {
                    let inner = self.clone();
                    handle.spawn(async move { inner.refresh(task.key).await });
                }
                _ => self.refresh(task.key).await,
            }
        }
        let purged = self.cache.purge_expired();
        if purged > 0 {
            tracing::trace!(purged, "expired cache entries purged");
        }
    }

    async fn refresh(self: &Arc<Self>, key: String) {
        let (buckets, execute) = {
            let refreshers = self.lock_refreshers();
            let Some(job) = refreshers.get(&key) else {
                return;
            };
            if job.in_flight.as_ref().is_some_and(|handle| !handle.is_resolved()) {
                tracing::debug!(key = %key, "previous refresh still pending; skipped");
                return;
            }
            (job.buckets.clone(), job.execute.clone())
        };
        let request = Request::from_fn(key.clone(), buckets.iter().cloned(), execute)
            .priority(Priority::Refresh)
            .bypass_cache()
            .cache_ttl(self.config.hot_keys.refresh_ttl);
        match self.submit(request).await {
            Ok(handle) => {
                if let Some(job) = self.lock_refreshers().get_mut(&key) {
                    job.in_flight = Some(handle);
                }
                self.emit(HotKeyEvent::RefreshScheduled { key });
            }
            Err(error) => {
                tracing::warn!(
                    key = %key,
                    error = %ErrorKind(&error),
                    "hot-key refresh not submitted"
                );
            }
        }
    }

    fn circuit_tick(&self) {
        for bucket in self.breakers.tick() {
            self.queue.clear_circuit_backoff(&bucket);
            self.emit(CircuitEvent::HalfOpen { bucket });
        }
    }

    fn emit(&self, event: impl Into<CoordinatorEvent>) {
        self.emitter.emit(event.into());
    }

    fn lock_refreshers(&self) -> MutexGuard<'_, HashMap<String, RefreshJob<T, E>>> {
        self.refreshers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, E> Inner<T, E> {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        let queued = self.queue.take_all();
        let cancelled = queued.len();
        for request in queued {
            self.pending.remove(&request.id);
            request.payload.slot.resolve(Err(CoordinatorError::Cancelled));
        }
        self.refreshers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::info!(cancelled, "coordinator shut down");
    }
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Renders a coordinator error without requiring `E: Display`.
struct ErrorKind<'a, E>(&'a CoordinatorError<E>);

impl<E> fmt::Display for ErrorKind<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            CoordinatorError::QueueFull { priority, capacity } => {
                write!(f, "queue full for {} tier (capacity {})", priority, capacity)
            }
            CoordinatorError::InvalidRequest { reason } => write!(f, "invalid request: {}", reason),
            CoordinatorError::QuotaExceeded { bucket, .. } => {
                write!(f, "quota exhausted: {}", bucket)
            }
            CoordinatorError::CircuitOpen { bucket } => write!(f, "circuit open: {}", bucket),
            CoordinatorError::Upstream { attempts, .. } => {
                write!(f, "upstream failed ({} attempts)", attempts)
            }
            CoordinatorError::Expired { .. } => f.write_str("expired"),
            CoordinatorError::Cancelled => f.write_str("cancelled"),
        }
    }
}

async fn drain_worker<T, E>(
    inner: Weak<Inner<T, E>>,
    group: GroupKey,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    tick: Duration,
) where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + Sync + 'static,
{
    tracing::debug!(group = ?group, "drain worker started");
    loop {
        {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.drain_group(&group, false).await;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = notify.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }
    tracing::debug!(group = ?group, "drain worker stopped");
}

async fn hot_key_worker<T, E>(
    inner: Weak<Inner<T, E>>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.hot_key_tick(false).await;
    }
}

async fn circuit_worker<T, E>(
    inner: Weak<Inner<T, E>>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Clone + Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.circuit_tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use std::sync::atomic::AtomicUsize;

    type Coord = Coordinator<u32, String>;

    fn manual(clock: &ManualClock, config: CoordinatorConfig) -> Coord {
        Coord::builder(config).clock(clock.clone()).manual().build().unwrap()
    }

    fn one_bucket(max_requests: u32, window: Duration) -> CoordinatorConfig {
        CoordinatorConfig::default().with_bucket("a", max_requests, window)
    }

    type Upstream = Arc<dyn Fn() -> futures::future::Ready<Result<u32, String>> + Send + Sync>;

    /// Upstream stub returning how many times it was called before.
    fn counter() -> (Arc<AtomicUsize>, Upstream) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let execute: Upstream = Arc::new(move || {
            let n = seen.fetch_add(1, Ordering::SeqCst) as u32;
            futures::future::ready(Ok(n))
        });
        (calls, execute)
    }

    #[tokio::test]
    async fn rejects_empty_and_unknown_buckets() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(1)));
        let (_, execute) = counter();

        let e = execute.clone();
        let err = coordinator
            .submit("k", Vec::<String>::new(), Priority::Interactive, move || e())
            .await
            .unwrap_err();
        assert!(err.is_invalid_request());

        let e = execute.clone();
        let err = coordinator
            .submit("k", ["nope"], Priority::Interactive, move || e())
            .await
            .unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[tokio::test]
    async fn cache_hit_consumes_no_quota() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(60)));
        let (calls, execute) = counter();

        for _ in 0..3 {
            let e = execute.clone();
            let handle =
                coordinator.submit("k", ["a"], Priority::Interactive, move || e()).await.unwrap();
            assert_eq!(handle.wait().await.unwrap(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.get_quota_status("a").unwrap().used, 1);
        assert_eq!(coordinator.cache_stats().local_hits, 2);
    }

    #[tokio::test]
    async fn queued_request_waits_for_window_and_keeps_fifo() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(1)));
        let (_, execute) = counter();

        let mut handles = Vec::new();
        for key in ["k1", "k2", "k3"] {
            let e = execute.clone();
            let request = Request::new(key, ["a"], move || e()).no_cache();
            handles.push(coordinator.submit_request(request).await.unwrap());
        }
        assert!(handles[0].is_resolved());
        assert_eq!(coordinator.queued_len(), 2);

        assert_eq!(coordinator.drain_now().await, 0, "window still exhausted");
        clock.advance(Duration::from_secs(1));
        assert_eq!(coordinator.drain_now().await, 1);
        assert_eq!(handles[1].wait().await.unwrap(), 1);
        assert!(!handles[2].is_resolved());

        clock.advance(Duration::from_secs(1));
        coordinator.drain_now().await;
        assert_eq!(handles[2].wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_by_id_resolves_immediately() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(1)));
        let (calls, execute) = counter();

        let e = execute.clone();
        let _first =
            coordinator.submit("k1", ["a"], Priority::Interactive, move || e()).await.unwrap();
        let e = execute.clone();
        let queued =
            coordinator.submit("k2", ["a"], Priority::Interactive, move || e()).await.unwrap();

        assert!(coordinator.cancel(queued.id()));
        assert!(!coordinator.cancel(queued.id()));
        assert!(queued.wait().await.unwrap_err().is_cancelled());

        clock.advance(Duration::from_secs(1));
        assert_eq!(coordinator.drain_now().await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.get_quota_status("a").unwrap().used, 0, "no quota spent on it");
    }

    #[tokio::test]
    async fn upstream_failure_retries_then_surfaces() {
        let clock = ManualClock::new();
        let queue = QueueConfig {
            max_attempts: 2,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(100),
            retry_jitter: false,
            ..Default::default()
        };
        let config = CoordinatorConfig::default()
            .with_bucket("a", 10, Duration::from_secs(1))
            .with_queue(queue);
        let coordinator = manual(&clock, config);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = coordinator
            .submit("k", ["a"], Priority::Interactive, move || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>("boom".to_string()) }
            })
            .await
            .unwrap();
        assert!(!handle.is_resolved(), "re-queued after first failure");

        assert_eq!(coordinator.drain_now().await, 0, "backoff not elapsed");
        clock.advance(Duration::from_millis(100));
        assert_eq!(coordinator.drain_now().await, 1);

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.attempts(), Some(2));
        assert_eq!(err.into_upstream().as_deref(), Some("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_requests() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(1)));
        let (_, execute) = counter();

        let e = execute.clone();
        coordinator.submit("k1", ["a"], Priority::Interactive, move || e()).await.unwrap();
        let e = execute.clone();
        let queued =
            coordinator.submit("k2", ["a"], Priority::Interactive, move || e()).await.unwrap();

        coordinator.shutdown();
        assert!(queued.wait().await.unwrap_err().is_cancelled());
        assert_eq!(coordinator.queued_len(), 0);

        let e = execute.clone();
        let err =
            coordinator.submit("k3", ["a"], Priority::Interactive, move || e()).await.unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[tokio::test]
    async fn exhausted_quota_is_absorbed_by_the_queue() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(1)));
        let (_, execute) = counter();

        let e = execute.clone();
        coordinator.submit("k1", ["a"], Priority::Interactive, move || e()).await.unwrap();
        let e = execute.clone();
        let queued = coordinator.submit("k2", ["a"], Priority::Interactive, move || e()).await;
        let queued = queued.unwrap();
        assert!(queued.try_result().is_none(), "no QuotaExceeded outcome is delivered");

        clock.advance(Duration::from_secs(1));
        coordinator.drain_now().await;
        assert_eq!(queued.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn buckets_added_at_runtime_gate_requests() {
        let clock = ManualClock::new();
        let coordinator = manual(&clock, one_bucket(1, Duration::from_secs(1)));
        let (calls, execute) = counter();

        let e = execute.clone();
        let err = coordinator.submit("k", ["b"], Priority::Interactive, move || e()).await;
        assert!(err.unwrap_err().is_invalid_request());

        coordinator.add_bucket(BucketConfig::new("b", 2, Duration::from_secs(1)).unwrap()).unwrap();
        assert_eq!(coordinator.get_circuit_status("b"), Some(CircuitState::Closed));
        let e = execute.clone();
        let handle =
            coordinator.submit("k", ["a", "b"], Priority::Interactive, move || e()).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.get_quota_status("b").unwrap().remaining, 1);
    }

    #[test]
    fn workers_need_a_runtime() {
        let err = Coord::builder(CoordinatorConfig::default()).build().unwrap_err();
        assert!(matches!(err, ConfigError::RuntimeUnavailable));
    }
}
