//! Hot-Key Tracker: per-key miss counters over fixed windows, with promotion and demotion.
//!
//! A key whose misses exceed `threshold` within one window is promoted and gets a refresh due
//! every `refresh_period`. Once promoted, cache hits count as accesses too, since the refresh
//! keeps the key from missing. A promoted key whose windows keep closing with fewer than
//! `demotion_threshold` accesses is demoted after `demotion_windows` such windows in a row; its
//! refresh schedule goes with it.
//!
//! The tracker only decides *which* keys are due; re-fetching them is the scheduler's job.

use crate::cache::MissObserver;
use crate::clock::{millis, Clock};
use crate::config::HotKeyConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Snapshot of one tracked key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotKeyStat {
    pub key: String,
    pub access_count: u64,
    pub window_start: u64,
    pub promoted: bool,
    /// Consecutive closed windows below the demotion threshold.
    pub quiet_windows: u32,
    /// Clock reading at which the next proactive refresh is due (promoted keys only).
    pub next_refresh_at: Option<u64>,
}

/// A proactive re-fetch the scheduler should submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTask {
    pub key: String,
    pub due_at: u64,
}

/// Work produced by one [`HotKeyTracker::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerTick {
    pub refreshes: Vec<RefreshTask>,
    pub demoted: Vec<String>,
}

#[derive(Debug)]
pub struct HotKeyTracker {
    config: HotKeyConfig,
    window_ms: u64,
    refresh_ms: u64,
    stats: Mutex<HashMap<String, HotKeyStat>>,
    /// Demotions noticed outside `tick`, reported by the next one.
    demoted: Mutex<Vec<String>>,
    clock: Arc<dyn Clock>,
}

impl HotKeyTracker {
    pub fn new(config: HotKeyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_ms: millis(config.window).max(1),
            refresh_ms: millis(config.refresh_period).max(1),
            config,
            stats: Mutex::new(HashMap::new()),
            demoted: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Count one access. Returns `true` when this access promoted the key.
    pub fn record_access(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut stats = self.lock();
        if !stats.contains_key(key) && stats.len() >= self.config.max_tracked_keys {
            tracing::debug!(key = %key, "hot-key tracker full; access not tracked");
            return false;
        }
        let stat = stats.entry(key.to_string()).or_insert_with(|| HotKeyStat {
            key: key.to_string(),
            access_count: 0,
            window_start: now,
            promoted: false,
            quiet_windows: 0,
            next_refresh_at: None,
        });
        if self.roll(stat, now) {
            tracing::info!(key = %key, "hot key demoted");
            self.defer_demotion(key);
        }
        stat.access_count += 1;
        if !stat.promoted && stat.access_count > self.config.threshold {
            stat.promoted = true;
            stat.quiet_windows = 0;
            stat.next_refresh_at = Some(now.saturating_add(self.refresh_ms));
            tracing::info!(
                key = %key,
                accesses = stat.access_count,
                threshold = self.config.threshold,
                "hot key promoted"
            );
            return true;
        }
        false
    }

    /// Count a cache hit on a promoted key toward its current window. Hits never promote.
    pub fn record_hit(&self, key: &str) {
        let now = self.clock.now_millis();
        let mut stats = self.lock();
        let Some(stat) = stats.get_mut(key).filter(|stat| stat.promoted) else {
            return;
        };
        if self.roll(stat, now) {
            tracing::info!(key = %key, "hot key demoted");
            self.defer_demotion(key);
            return;
        }
        stat.access_count += 1;
    }

    pub fn is_promoted(&self, key: &str) -> bool {
        self.lock().get(key).is_some_and(|stat| stat.promoted)
    }

    pub fn promoted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> =
            self.lock().values().filter(|s| s.promoted).map(|s| s.key.clone()).collect();
        keys.sort();
        keys
    }

    pub fn stat(&self, key: &str) -> Option<HotKeyStat> {
        self.lock().get(key).cloned()
    }

    pub fn tracked_len(&self) -> usize {
        self.lock().len()
    }

    /// Roll elapsed windows, demote quiet keys, and collect refreshes that are due.
    ///
    /// Each due refresh is rescheduled one period later, so a slow consumer sees at most one
    /// task per key per tick. Idle unpromoted keys are forgotten.
    pub fn tick(&self) -> TrackerTick {
        let now = self.clock.now_millis();
        let mut out = TrackerTick::default();
        let mut stats = self.lock();
        out.demoted.append(&mut self.demoted.lock().unwrap_or_else(PoisonError::into_inner));
        for stat in stats.values_mut() {
            if self.roll(stat, now) {
                tracing::info!(key = %stat.key, "hot key demoted");
                out.demoted.push(stat.key.clone());
            }
            if let Some(due_at) = stat.next_refresh_at.filter(|due| *due <= now) {
                out.refreshes.push(RefreshTask { key: stat.key.clone(), due_at });
                stat.next_refresh_at = Some(now.saturating_add(self.refresh_ms));
            }
        }
        stats.retain(|_, stat| stat.promoted || stat.access_count > 0);
        out.refreshes.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.key.cmp(&b.key)));
        out.demoted.sort();
        out
    }

    /// Close every window that ended before `now`. Returns `true` if the key was demoted.
    fn roll(&self, stat: &mut HotKeyStat, now: u64) -> bool {
        let elapsed = now.saturating_sub(stat.window_start) / self.window_ms;
        if elapsed == 0 {
            return false;
        }
        let mut demoted = false;
        if stat.promoted {
            if stat.access_count < self.config.demotion_threshold {
                stat.quiet_windows = stat.quiet_windows.saturating_add(1);
            } else {
                stat.quiet_windows = 0;
            }
            // Windows after the first closed with no accesses at all.
            let empty = u32::try_from(elapsed - 1).unwrap_or(u32::MAX);
            stat.quiet_windows = stat.quiet_windows.saturating_add(empty);
            if stat.quiet_windows >= self.config.demotion_windows {
                stat.promoted = false;
                stat.quiet_windows = 0;
                stat.next_refresh_at = None;
                demoted = true;
            }
        }
        stat.access_count = 0;
        stat.window_start =
            stat.window_start.saturating_add(elapsed.saturating_mul(self.window_ms));
        demoted
    }

    fn defer_demotion(&self, key: &str) {
        self.demoted.lock().unwrap_or_else(PoisonError::into_inner).push(key.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HotKeyStat>> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MissObserver for HotKeyTracker {
    fn record_miss(&self, key: &str) {
        self.record_access(key);
    }
}
