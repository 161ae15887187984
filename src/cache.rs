//! Two-tier cache: a small process-local LRU in front of a larger shared tier.
//!
//! - The local tier is bounded by entry count (LRU eviction via `IndexMap` ordering) and caps
//!   every entry's lifetime at `local_ttl`.
//! - The shared tier is pluggable through [`SharedTier`] and evicts purely by TTL. The default
//!   [`InMemorySharedTier`] is a sharded `DashMap`, so readers never wait on writes to unrelated
//!   keys.
//! - A local miss consults the shared tier; a shared hit repopulates the local tier. A miss in
//!   both tiers is reported to the registered [`MissObserver`] before the caller goes upstream.
//!
//! Entries are replaced whole; readers see either the previous entry or the new one.

use crate::clock::{millis, Clock};
use crate::config::CacheConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Boxed error returned by shared-tier backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A cached upstream result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    /// Clock reading (millis) after which the entry is dead.
    pub expires_at: u64,
    /// Monotonic per cache layer; a refresh always carries a higher version than what it replaces.
    pub version: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Storage interface for the shared tier (in-memory here, Redis or similar in a deployment).
#[async_trait]
pub trait SharedTier<V>: Send + Sync + std::fmt::Debug {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry<V>>, BoxError>;
    async fn store(&self, entry: CacheEntry<V>) -> Result<(), BoxError>;
    async fn remove(&self, key: &str) -> Result<(), BoxError>;
    /// Drop expired entries. Backends with native TTLs can leave this as a no-op.
    fn purge_expired(&self, _now: u64) -> usize {
        0
    }
}

/// Default shared tier backed by a sharded concurrent map.
#[derive(Debug)]
pub struct InMemorySharedTier<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V> Default for InMemorySharedTier<V> {
    fn default() -> Self {
        Self { entries: DashMap::new() }
    }
}

impl<V> InMemorySharedTier<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl<V> SharedTier<V> for InMemorySharedTier<V>
where
    V: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    async fn load(&self, key: &str) -> Result<Option<CacheEntry<V>>, BoxError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn store(&self, entry: CacheEntry<V>) -> Result<(), BoxError> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), BoxError> {
        self.entries.remove(key);
        Ok(())
    }

    fn purge_expired(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }
}

/// Receives every full cache miss (absent from both tiers).
pub trait MissObserver: Send + Sync + std::fmt::Debug {
    fn record_miss(&self, key: &str);
}

/// Where a lookup was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Local(V),
    Shared(V),
    Miss,
}

impl<V> Lookup<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Lookup::Local(v) | Lookup::Shared(v) => Some(v),
            Lookup::Miss => None,
        }
    }
}

/// Snapshot of hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from either tier. 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.shared_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    misses: AtomicU64,
}

/// Two-tier cache owned by the coordinator.
#[derive(Debug)]
pub struct CacheLayer<V> {
    local: Mutex<IndexMap<String, CacheEntry<V>>>,
    local_capacity: usize,
    local_ttl: u64,
    shared: Arc<dyn SharedTier<V>>,
    clock: Arc<dyn Clock>,
    next_version: AtomicU64,
    observer: Option<Arc<dyn MissObserver>>,
    counters: Counters,
}

impl<V> CacheLayer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: &CacheConfig,
        shared: Arc<dyn SharedTier<V>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            local: Mutex::new(IndexMap::with_capacity(config.local_capacity)),
            local_capacity: config.local_capacity.max(1),
            local_ttl: millis(config.local_ttl),
            shared,
            clock,
            next_version: AtomicU64::new(1),
            observer: None,
            counters: Counters::default(),
        }
    }

    /// Report full misses to `observer`.
    pub fn with_miss_observer(mut self, observer: Arc<dyn MissObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Value for `key` from either tier, or `None` on a full miss.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.lookup(key).await.into_value()
    }

    /// Like [`get`](Self::get) but reports which tier answered.
    pub async fn lookup(&self, key: &str) -> Lookup<V> {
        let now = self.clock.now_millis();
        if let Some(value) = self.local_get(key, now) {
            self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Local(value);
        }

        match self.shared.load(key).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                self.counters.shared_hits.fetch_add(1, Ordering::Relaxed);
                let value = entry.value.clone();
                self.local_insert(entry, now);
                return Lookup::Shared(value);
            }
            Ok(Some(_)) => {
                if let Err(error) = self.shared.remove(key).await {
                    tracing::warn!(key = %key, %error, "failed to drop expired shared entry");
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(key = %key, %error, "shared cache tier unavailable; miss");
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.record_miss(key);
        }
        Lookup::Miss
    }

    /// Write `value` to both tiers, replacing any previous entry. Returns the new version.
    pub async fn put(&self, key: &str, value: V, ttl: Duration) -> u64 {
        let now = self.clock.now_millis();
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            expires_at: now.saturating_add(millis(ttl)),
            version,
        };
        self.local_insert(entry.clone(), now);
        if let Err(error) = self.shared.store(entry).await {
            tracing::warn!(key = %key, %error, "failed to write shared cache tier");
        }
        version
    }

    /// Remove `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.lock_local().shift_remove(key);
        if let Err(error) = self.shared.remove(key).await {
            tracing::warn!(key = %key, %error, "failed to invalidate shared cache tier");
        }
    }

    /// Drop expired entries from both tiers; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let local_removed = {
            let mut local = self.lock_local();
            let before = local.len();
            local.retain(|_, entry| !entry.is_expired(now));
            before - local.len()
        };
        local_removed + self.shared.purge_expired(now)
    }

    /// Entry currently held by the local tier, expired or not.
    pub fn local_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.lock_local().get(key).cloned()
    }

    pub fn local_len(&self) -> usize {
        self.lock_local().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            shared_hits: self.counters.shared_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    fn lock_local(&self) -> std::sync::MutexGuard<'_, IndexMap<String, CacheEntry<V>>> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_get(&self, key: &str, now: u64) -> Option<V> {
        let mut local = self.lock_local();
        let entry = local.shift_remove(key)?;
        if entry.is_expired(now) {
            return None;
        }
        let value = entry.value.clone();
        // Re-inserting moves the key to the back: most recently used.
        local.insert(key.to_string(), entry);
        Some(value)
    }

    fn local_insert(&self, mut entry: CacheEntry<V>, now: u64) {
        entry.expires_at = entry.expires_at.min(now.saturating_add(self.local_ttl));
        let mut local = self.lock_local();
        local.shift_remove(&entry.key);
        while local.len() >= self.local_capacity {
            if local.shift_remove_index(0).is_none() {
                break;
            }
        }
        local.insert(entry.key.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Debug, Default)]
    struct RecordingObserver(Mutex<Vec<String>>);

    impl MissObserver for RecordingObserver {
        fn record_miss(&self, key: &str) {
            self.0.lock().unwrap().push(key.to_string());
        }
    }

    #[derive(Debug)]
    struct BrokenTier;

    #[async_trait]
    impl SharedTier<u32> for BrokenTier {
        async fn load(&self, _key: &str) -> Result<Option<CacheEntry<u32>>, BoxError> {
            Err("connection refused".into())
        }
        async fn store(&self, _entry: CacheEntry<u32>) -> Result<(), BoxError> {
            Err("connection refused".into())
        }
        async fn remove(&self, _key: &str) -> Result<(), BoxError> {
            Err("connection refused".into())
        }
    }

    fn config(capacity: usize, local_ttl_ms: u64) -> CacheConfig {
        CacheConfig {
            local_capacity: capacity,
            local_ttl: Duration::from_millis(local_ttl_ms),
            default_ttl: Duration::from_secs(60),
        }
    }

    fn layer(clock: &ManualClock, capacity: usize, local_ttl_ms: u64) -> CacheLayer<u32> {
        CacheLayer::new(
            &config(capacity, local_ttl_ms),
            Arc::new(InMemorySharedTier::new()),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn put_then_get_until_ttl_expires() {
        let clock = ManualClock::new();
        let cache = layer(&clock, 8, 10_000);

        cache.put("summoner:1", 7, Duration::from_millis(500)).await;
        assert_eq!(cache.get("summoner:1").await, Some(7));

        clock.advance(Duration::from_millis(500));
        assert_eq!(cache.get("summoner:1").await, None);
    }

    #[tokio::test]
    async fn shared_hit_repopulates_local_tier() {
        let clock = ManualClock::new();
        let cache = layer(&clock, 8, 100);

        cache.put("k", 1, Duration::from_secs(10)).await;
        assert_eq!(cache.local_entry("k").unwrap().expires_at, 100, "local lifetime is capped");

        clock.advance(Duration::from_millis(150));
        assert_eq!(cache.lookup("k").await, Lookup::Shared(1));
        assert_eq!(cache.local_entry("k").unwrap().expires_at, 250);
        assert_eq!(cache.lookup("k").await, Lookup::Local(1));

        let stats = cache.stats();
        assert_eq!((stats.local_hits, stats.shared_hits, stats.misses), (1, 1, 0));
    }

    #[tokio::test]
    async fn local_tier_evicts_least_recently_used() {
        let clock = ManualClock::new();
        let cache = layer(&clock, 2, 10_000);

        cache.put("a", 1, Duration::from_secs(60)).await;
        cache.put("b", 2, Duration::from_secs(60)).await;
        assert_eq!(cache.lookup("a").await, Lookup::Local(1));
        cache.put("c", 3, Duration::from_secs(60)).await;

        assert_eq!(cache.local_len(), 2);
        assert!(cache.local_entry("b").is_none(), "b was least recently used");
        assert!(cache.local_entry("a").is_some());
        assert_eq!(cache.lookup("b").await, Lookup::Shared(2));
    }

    #[tokio::test]
    async fn full_miss_is_reported_once() {
        let clock = ManualClock::new();
        let observer = Arc::new(RecordingObserver::default());
        let cache = layer(&clock, 4, 1_000).with_miss_observer(observer.clone());

        assert_eq!(cache.lookup("cold").await, Lookup::Miss);
        cache.put("warm", 5, Duration::from_secs(5)).await;
        assert_eq!(cache.get("warm").await, Some(5));

        assert_eq!(*observer.0.lock().unwrap(), vec!["cold".to_string()]);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() {
        let clock = ManualClock::new();
        let cache = layer(&clock, 4, 1_000);
        cache.put("k", 1, Duration::from_secs(60)).await;
        cache.invalidate("k").await;
        assert_eq!(cache.lookup("k").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn versions_increase_on_overwrite() {
        let clock = ManualClock::new();
        let cache = layer(&clock, 4, 1_000);
        let first = cache.put("k", 1, Duration::from_secs(60)).await;
        let second = cache.put("k", 2, Duration::from_secs(60)).await;
        assert!(second > first);
        let entry = cache.local_entry("k").unwrap();
        assert_eq!((entry.value, entry.version), (2, second));
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let clock = ManualClock::new();
        let shared = Arc::new(InMemorySharedTier::new());
        let cache = CacheLayer::new(&config(4, 1_000), shared.clone(), Arc::new(clock.clone()));
        cache.put("short", 1, Duration::from_millis(10)).await;
        cache.put("long", 2, Duration::from_secs(60)).await;
        clock.advance(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 2, "one local and one shared entry");
        assert_eq!(shared.len(), 1);
        assert_eq!(cache.get("long").await, Some(2));
    }

    #[tokio::test]
    async fn shared_tier_errors_degrade_to_local_only() {
        let clock = ManualClock::new();
        let cache: CacheLayer<u32> =
            CacheLayer::new(&config(4, 1_000), Arc::new(BrokenTier), Arc::new(clock.clone()));
        cache.put("k", 9, Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(9));
        assert_eq!(cache.lookup("other").await, Lookup::Miss);
    }
}
