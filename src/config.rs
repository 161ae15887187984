//! Configuration surface for the coordinator.
//!
//! Plain structs with public fields and reference defaults. [`CoordinatorConfig::validate`] checks
//! everything once at construction; components assume validated values afterwards.
//!
//! With the `config-json` feature every struct is (de)serializable; durations are written in
//! milliseconds under `*_ms` keys:
//!
//! ```json
//! {
//!   "buckets": [{ "name": "summonerLookup", "max_requests": 2, "window_ms": 1000 }],
//!   "queue": { "max_size_per_tier": 64, "max_age_ms": 300000 }
//! }
//! ```

use crate::error::ConfigError;
use std::collections::HashSet;
use std::time::Duration;

#[cfg(feature = "config-json")]
use serde::{Deserialize, Serialize};

/// One quota bucket: at most `max_requests` admissions per fixed `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-json", derive(Serialize, Deserialize))]
pub struct BucketConfig {
    pub name: String,
    pub max_requests: u32,
    #[cfg_attr(feature = "config-json", serde(rename = "window_ms", with = "duration_ms"))]
    pub window: Duration,
}

impl BucketConfig {
    /// Create a validated bucket config.
    pub fn new(
        name: impl Into<String>,
        max_requests: u32,
        window: Duration,
    ) -> Result<Self, ConfigError> {
        let cfg = Self { name: name.into(), max_requests, window };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyBucketName);
        }
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidMaxRequests { name: self.name.clone() });
        }
        if self.window.is_zero() {
            return Err(ConfigError::InvalidWindow { name: self.name.clone() });
        }
        Ok(())
    }
}

/// Hot-key detection and proactive refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-json", serde(default))]
pub struct HotKeyConfig {
    /// Promote once more than this many misses land inside one window.
    pub threshold: u64,
    #[cfg_attr(feature = "config-json", serde(rename = "window_ms", with = "duration_ms"))]
    pub window: Duration,
    #[cfg_attr(feature = "config-json", serde(rename = "refresh_period_ms", with = "duration_ms"))]
    pub refresh_period: Duration,
    /// A window with fewer accesses than this counts toward demotion.
    pub demotion_threshold: u64,
    /// Consecutive quiet windows before a promoted key is demoted.
    pub demotion_windows: u32,
    /// TTL written for refreshed entries.
    #[cfg_attr(feature = "config-json", serde(rename = "refresh_ttl_ms", with = "duration_ms"))]
    pub refresh_ttl: Duration,
    /// Upper bound on tracked keys; accesses to new keys beyond it are ignored.
    pub max_tracked_keys: usize,
    #[cfg_attr(feature = "config-json", serde(rename = "tick_ms", with = "duration_ms"))]
    pub tick: Duration,
}

impl Default for HotKeyConfig {
    fn default() -> Self {
        Self {
            threshold: 100,
            window: Duration::from_secs(5 * 60),
            refresh_period: Duration::from_secs(60),
            demotion_threshold: 10,
            demotion_windows: 2,
            refresh_ttl: Duration::from_secs(120),
            max_tracked_keys: 10_000,
            tick: Duration::from_secs(1),
        }
    }
}

impl HotKeyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.threshold, "hot_keys.threshold")?;
        non_zero(self.window, "hot_keys.window")?;
        non_zero(self.refresh_period, "hot_keys.refresh_period")?;
        non_zero(self.refresh_ttl, "hot_keys.refresh_ttl")?;
        non_zero(self.tick, "hot_keys.tick")?;
        positive(u64::from(self.demotion_windows), "hot_keys.demotion_windows")?;
        positive(self.max_tracked_keys as u64, "hot_keys.max_tracked_keys")?;
        if self.demotion_threshold > self.threshold {
            return Err(ConfigError::DemotionAbovePromotion {
                promotion: self.threshold,
                demotion: self.demotion_threshold,
            });
        }
        Ok(())
    }
}

/// Per-bucket upstream circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-json", serde(default))]
pub struct CircuitConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: usize,
    /// How long the breaker stays open before allowing probes.
    #[cfg_attr(feature = "config-json", serde(rename = "open_duration_ms", with = "duration_ms"))]
    pub open_duration: Duration,
    /// Trial requests allowed while half-open.
    pub probe_count: usize,
    /// Failures further apart than this do not count as consecutive. Zero disables the window.
    #[cfg_attr(feature = "config-json", serde(rename = "failure_window_ms", with = "duration_ms"))]
    pub failure_window: Duration,
    #[cfg_attr(feature = "config-json", serde(rename = "probe_tick_ms", with = "duration_ms"))]
    pub probe_tick: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            probe_count: 1,
            failure_window: Duration::from_secs(60),
            probe_tick: Duration::from_secs(1),
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.failure_threshold as u64, "circuit.failure_threshold")?;
        positive(self.probe_count as u64, "circuit.probe_count")?;
        non_zero(self.open_duration, "circuit.open_duration")?;
        non_zero(self.probe_tick, "circuit.probe_tick")
    }
}

/// Admission queue limits and retry cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-json", serde(default))]
pub struct QueueConfig {
    pub max_size_per_tier: usize,
    /// Deadline for a queued request, measured from submission.
    #[cfg_attr(feature = "config-json", serde(rename = "max_age_ms", with = "duration_ms"))]
    pub max_age: Duration,
    /// Upstream executions allowed per request, including the first.
    pub max_attempts: u32,
    #[cfg_attr(feature = "config-json", serde(rename = "drain_tick_ms", with = "duration_ms"))]
    pub drain_tick: Duration,
    /// Base delay before re-running a request whose upstream call failed.
    #[cfg_attr(feature = "config-json", serde(rename = "retry_backoff_ms", with = "duration_ms"))]
    pub retry_backoff: Duration,
    #[cfg_attr(
        feature = "config-json",
        serde(rename = "retry_backoff_max_ms", with = "duration_ms")
    )]
    pub retry_backoff_max: Duration,
    /// Apply full jitter to upstream retry delays.
    pub retry_jitter: bool,
    /// How long a group blocked by an open breaker waits before re-checking.
    #[cfg_attr(feature = "config-json", serde(rename = "circuit_backoff_ms", with = "duration_ms"))]
    pub circuit_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size_per_tier: 1_000,
            max_age: Duration::from_secs(5 * 60),
            max_attempts: 3,
            drain_tick: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
            retry_jitter: true,
            circuit_backoff: Duration::from_secs(10),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.max_size_per_tier as u64, "queue.max_size_per_tier")?;
        positive(u64::from(self.max_attempts), "queue.max_attempts")?;
        non_zero(self.max_age, "queue.max_age")?;
        non_zero(self.drain_tick, "queue.drain_tick")?;
        if self.retry_backoff_max < self.retry_backoff {
            return Err(ConfigError::BackoffMaxBelowBase {
                base: self.retry_backoff,
                max: self.retry_backoff_max,
            });
        }
        Ok(())
    }
}

/// Two-tier cache sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config-json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-json", serde(default))]
pub struct CacheConfig {
    /// Entry bound for the process-local LRU tier.
    pub local_capacity: usize,
    /// Local entries never live longer than this, whatever TTL the writer asked for.
    #[cfg_attr(feature = "config-json", serde(rename = "local_ttl_ms", with = "duration_ms"))]
    pub local_ttl: Duration,
    /// TTL used when a request does not specify one.
    #[cfg_attr(feature = "config-json", serde(rename = "default_ttl_ms", with = "duration_ms"))]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 1_024,
            local_ttl: Duration::from_secs(30),
            default_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.local_capacity as u64, "cache.local_capacity")?;
        non_zero(self.local_ttl, "cache.local_ttl")?;
        non_zero(self.default_ttl, "cache.default_ttl")
    }
}

/// Full coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "config-json", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-json", serde(default))]
pub struct CoordinatorConfig {
    pub buckets: Vec<BucketConfig>,
    pub hot_keys: HotKeyConfig,
    pub circuit: CircuitConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
}

impl CoordinatorConfig {
    /// Add a bucket, builder style. Validation happens in [`validate`](Self::validate).
    pub fn with_bucket(
        mut self,
        name: impl Into<String>,
        max_requests: u32,
        window: Duration,
    ) -> Self {
        self.buckets.push(BucketConfig { name: name.into(), max_requests, window });
        self
    }

    pub fn with_hot_keys(mut self, hot_keys: HotKeyConfig) -> Self {
        self.hot_keys = hot_keys;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for bucket in &self.buckets {
            bucket.validate()?;
            if !seen.insert(bucket.name.as_str()) {
                return Err(ConfigError::DuplicateBucket(bucket.name.clone()));
            }
        }
        self.hot_keys.validate()?;
        self.circuit.validate()?;
        self.queue.validate()?;
        self.cache.validate()
    }

    /// Parse and validate a JSON document.
    #[cfg(feature = "config-json")]
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn positive(value: u64, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::MustBePositive { field });
    }
    Ok(())
}

fn non_zero(value: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::MustBePositive { field });
    }
    Ok(())
}

#[cfg(feature = "config-json")]
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(crate::clock::millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
