//! Quota Ledger: fixed-window admission counters per named bucket.
//!
//! The ledger is the only source of truth for "may this upstream call happen now". A request may
//! be gated by several buckets at once (a global bucket plus a per-operation one, say); admission
//! consumes one unit from every named bucket or from none of them.
//!
//! # Atomicity
//!
//! [`QuotaLedger::acquire`] reads the clock once, locks every named bucket in sorted-name order,
//! rolls expired windows against that single instant, checks all of them, and only then
//! increments. Sorted lock order keeps concurrent multi-bucket callers deadlock free, and holding
//! every lock across check-and-increment means two callers can never both see the last unit.

use crate::adaptive::DynamicConfig;
use crate::clock::{millis, Clock};
use crate::config::BucketConfig;
use crate::error::ConfigError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Capacity of one bucket, swappable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketLimits {
    pub max_requests: u32,
    pub window: Duration,
}

/// The result of a quota check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// One unit was consumed from every named bucket.
    Allowed {
        /// Smallest remaining capacity across the named buckets after this admission.
        remaining: u32,
    },
    /// Nothing was consumed.
    Denied {
        /// First bucket (in name order) found without capacity, or an unknown name.
        bucket: String,
        /// Time until that bucket's window resets.
        wait: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaStatus {
    pub bucket: String,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    /// Clock reading (millis) at which the current window ends.
    pub reset_at: u64,
    pub reset_in: Duration,
}

#[derive(Debug)]
struct Window {
    count: u32,
    started_at: u64,
}

impl Window {
    fn roll(&mut self, now: u64, window_ms: u64) {
        if now >= self.started_at.saturating_add(window_ms) {
            self.count = 0;
            self.started_at = now;
        }
    }
}

#[derive(Debug)]
struct Bucket {
    name: String,
    limits: DynamicConfig<BucketLimits>,
    window: Mutex<Window>,
}

impl Bucket {
    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-window quota ledger shared by every admission path.
#[derive(Debug)]
pub struct QuotaLedger {
    buckets: RwLock<BTreeMap<String, Arc<Bucket>>>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { buckets: RwLock::new(BTreeMap::new()), clock }
    }

    /// Build a ledger with every configured bucket registered.
    pub fn with_buckets(
        clock: Arc<dyn Clock>,
        buckets: &[BucketConfig],
    ) -> Result<Self, ConfigError> {
        let ledger = Self::new(clock);
        for bucket in buckets {
            ledger.register(bucket)?;
        }
        Ok(ledger)
    }

    /// Register (or replace) a bucket. A replaced bucket starts a fresh window.
    pub fn register(&self, config: &BucketConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let bucket = Arc::new(Bucket {
            name: config.name.clone(),
            limits: DynamicConfig::new(BucketLimits {
                max_requests: config.max_requests,
                window: config.window,
            }),
            window: Mutex::new(Window { count: 0, started_at: self.clock.now_millis() }),
        });
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        if map.insert(config.name.clone(), bucket).is_some() {
            tracing::warn!(bucket = %config.name, "quota bucket replaced; counters reset");
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Boolean form of [`acquire`](Self::acquire).
    pub fn try_consume<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.acquire(names).is_allowed()
    }

    /// Consume one unit from every named bucket, or from none.
    ///
    /// Duplicate names count once. Unknown names deny without consuming. Never blocks beyond
    /// the short per-bucket critical sections.
    pub fn acquire<S: AsRef<str>>(&self, names: &[S]) -> Decision {
        let selected = match self.select(names) {
            Ok(selected) => selected,
            Err(unknown) => {
                tracing::warn!(bucket = %unknown, "quota check against unknown bucket");
                return Decision::Denied { bucket: unknown, wait: Duration::ZERO };
            }
        };

        let now = self.clock.now_millis();
        let mut guards: Vec<MutexGuard<'_, Window>> = selected.iter().map(|b| b.lock()).collect();
        let mut remaining = u32::MAX;
        for (bucket, guard) in selected.iter().zip(guards.iter_mut()) {
            let limits = bucket.limits.get();
            let window_ms = millis(limits.window);
            guard.roll(now, window_ms);
            if guard.count >= limits.max_requests {
                let reset_at = guard.started_at.saturating_add(window_ms);
                let wait = Duration::from_millis(reset_at.saturating_sub(now));
                tracing::debug!(
                    bucket = %bucket.name,
                    used = guard.count,
                    ?wait,
                    "quota exhausted"
                );
                return Decision::Denied { bucket: bucket.name.clone(), wait };
            }
            remaining = remaining.min(limits.max_requests - guard.count - 1);
        }
        for guard in guards.iter_mut() {
            guard.count += 1;
        }
        Decision::Allowed { remaining }
    }

    /// Current usage of one bucket, or `None` if it is not registered.
    pub fn status(&self, name: &str) -> Option<QuotaStatus> {
        let bucket =
            self.buckets.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()?;
        let now = self.clock.now_millis();
        let mut guard = bucket.lock();
        let limits = bucket.limits.get();
        let window_ms = millis(limits.window);
        guard.roll(now, window_ms);
        let reset_at = guard.started_at.saturating_add(window_ms);
        Some(QuotaStatus {
            bucket: bucket.name.clone(),
            limit: limits.max_requests,
            used: guard.count,
            remaining: limits.max_requests.saturating_sub(guard.count),
            reset_at,
            reset_in: Duration::from_millis(reset_at.saturating_sub(now)),
        })
    }

    /// Change a bucket's limits without resetting its window.
    ///
    /// Lowering `max_requests` below the current count clamps the count so the ledger keeps
    /// reporting `used <= limit`.
    pub fn set_limits(&self, name: &str, limits: BucketLimits) -> Result<(), ConfigError> {
        let candidate = BucketConfig {
            name: name.to_string(),
            max_requests: limits.max_requests,
            window: limits.window,
        };
        candidate.validate()?;
        let bucket = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownBucket(name.to_string()))?;
        let mut guard = bucket.lock();
        bucket.limits.set(limits);
        guard.count = guard.count.min(limits.max_requests);
        tracing::info!(
            bucket = %name,
            max_requests = limits.max_requests,
            window = ?limits.window,
            "quota limits updated"
        );
        Ok(())
    }

    fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<Bucket>>, String> {
        let wanted: BTreeSet<&str> = names.iter().map(AsRef::as_ref).collect();
        let map = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        wanted
            .into_iter()
            .map(|name| map.get(name).cloned().ok_or_else(|| name.to_string()))
            .collect()
    }
}
