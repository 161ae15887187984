//! Admission Scheduler queue.
//!
//! Requests that could not be admitted wait here, grouped by the exact set of buckets they need.
//! Each group has one FIFO per priority tier. Groups that share a bucket drain together in a
//! single pass ordered by tier, then submission order, so a bucket's units always go to its
//! highest-priority oldest waiter. Groups with no bucket in common drain independently.
//!
//! Tier capacity is counted across all groups. A submission is rejected when its own tier, or any
//! higher tier, is full.

use crate::clock::millis;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Scheduling tier. Higher tiers drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "config-json", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config-json", serde(rename_all = "lowercase"))]
pub enum Priority {
    /// Best-effort population such as speculative prefetch.
    Background,
    /// Proactive refresh of a hot key.
    Refresh,
    /// User-initiated work.
    #[default]
    Interactive,
}

impl Priority {
    /// Every tier, highest first.
    pub const ALL: [Priority; 3] = [Priority::Interactive, Priority::Refresh, Priority::Background];

    fn index(self) -> usize {
        match self {
            Priority::Background => 0,
            Priority::Refresh => 1,
            Priority::Interactive => 2,
        }
    }

    /// Map a numeric hint (higher = sooner) onto a tier.
    pub fn from_hint(hint: u8) -> Self {
        match hint {
            0 => Priority::Background,
            1 => Priority::Refresh,
            _ => Priority::Interactive,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Background => f.write_str("background"),
            Priority::Refresh => f.write_str("refresh"),
            Priority::Interactive => f.write_str("interactive"),
        }
    }
}

/// Identifier handed out for every submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Sorted, de-duplicated bucket names shared by every request in a group.
pub type GroupKey = Arc<[String]>;

pub fn group_key<S: AsRef<str>>(buckets: &[S]) -> GroupKey {
    let names: BTreeSet<&str> = buckets.iter().map(AsRef::as_ref).collect();
    names.into_iter().map(str::to_string).collect::<Vec<_>>().into()
}

/// Lets the queue notice requests nobody is waiting for any more.
pub trait Withdrawn {
    /// `true` once the request should be dropped without running.
    fn is_withdrawn(&self) -> bool;
}

/// A request waiting for admission.
#[derive(Debug)]
pub struct QueuedRequest<R> {
    pub id: RequestId,
    pub key: String,
    pub group: GroupKey,
    pub priority: Priority,
    pub enqueued_at: u64,
    pub deadline: u64,
    /// Upstream executions so far.
    pub attempts: u32,
    /// Not eligible before this instant; set after a failed upstream attempt.
    pub not_before: u64,
    pub payload: R,
    seq: u64,
}

impl<R> QueuedRequest<R> {
    pub fn new(
        id: RequestId,
        key: impl Into<String>,
        group: GroupKey,
        priority: Priority,
        enqueued_at: u64,
        max_age: Duration,
        payload: R,
    ) -> Self {
        Self {
            id,
            key: key.into(),
            group,
            priority,
            enqueued_at,
            deadline: enqueued_at.saturating_add(millis(max_age)),
            attempts: 0,
            not_before: 0,
            payload,
            seq: 0,
        }
    }

    pub fn waited(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.enqueued_at))
    }
}

/// Verdict of the admission gate for one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Admit,
    QuotaExhausted { wait: Duration },
    CircuitOpen,
}

/// Why a drain pass stopped before reaching the end of its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    Quota { wait: Duration },
    /// Waiting out the circuit backoff until this instant.
    Circuit { until: u64 },
}

/// Everything a drain pass removed from its group.
#[derive(Debug)]
pub struct DrainPass<R> {
    /// Admitted requests in the order they must run.
    pub admitted: Vec<QueuedRequest<R>>,
    pub expired: Vec<QueuedRequest<R>>,
    pub withdrawn: Vec<QueuedRequest<R>>,
    pub blocked: Option<Blocked>,
}

impl<R> Default for DrainPass<R> {
    fn default() -> Self {
        Self { admitted: Vec::new(), expired: Vec::new(), withdrawn: Vec::new(), blocked: None }
    }
}

impl<R> DrainPass<R> {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.expired.is_empty() && self.withdrawn.is_empty()
    }
}

/// Returned when a tier has no room; the request is handed back untouched.
#[derive(Debug)]
pub struct Rejected<R> {
    pub request: QueuedRequest<R>,
    /// The full tier (the request's own or a higher one).
    pub tier: Priority,
    pub capacity: usize,
}

struct GroupState<R> {
    tiers: [BTreeMap<u64, QueuedRequest<R>>; 3],
    circuit_retry_at: Option<u64>,
}

struct Group<R> {
    state: Mutex<GroupState<R>>,
    notify: Arc<Notify>,
}

impl<R> Group<R> {
    fn lock(&self) -> MutexGuard<'_, GroupState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded, prioritized admission queue.
pub struct AdmissionQueue<R> {
    groups: RwLock<BTreeMap<GroupKey, Arc<Group<R>>>>,
    depth: [AtomicUsize; 3],
    capacity: usize,
    max_attempts: u32,
    circuit_backoff: u64,
    next_seq: AtomicU64,
}

impl<R> fmt::Debug for AdmissionQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("capacity", &self.capacity)
            .field("depth", &Priority::ALL.map(|p| self.depth(p)))
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl<R> AdmissionQueue<R> {
    pub fn new(capacity_per_tier: usize, max_attempts: u32, circuit_backoff: Duration) -> Self {
        Self {
            groups: RwLock::new(BTreeMap::new()),
            depth: Default::default(),
            capacity: capacity_per_tier,
            max_attempts,
            circuit_backoff: millis(circuit_backoff),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Queue a request behind everything already in its tier.
    ///
    /// A request that was queued before keeps its original place in line.
    pub fn enqueue(&self, mut request: QueuedRequest<R>) -> Result<(), Rejected<R>> {
        if let Some(tier) = self.full_tier_at_or_above(request.priority) {
            return Err(Rejected { request, tier, capacity: self.capacity });
        }
        if !self.reserve(request.priority) {
            let tier = request.priority;
            return Err(Rejected { request, tier, capacity: self.capacity });
        }
        if request.seq == 0 {
            request.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        }
        let group = self.group_or_insert(&request.group);
        group.lock().tiers[request.priority.index()].insert(request.seq, request);
        group.notify.notify_one();
        Ok(())
    }

    /// Wake-up handle for the group's drain worker; creates the group if needed.
    pub fn notifier(&self, key: &GroupKey) -> Arc<Notify> {
        self.group_or_insert(key).notify.clone()
    }

    /// Sweep withdrawn and expired requests, then admit ready requests through `gate`.
    ///
    /// The pass covers every group connected to `key` through a shared bucket, in one order:
    /// higher tiers first, then submission order. A refused request holds back everything behind
    /// it on any of its buckets; groups sharing no bucket with it keep draining.
    ///
    /// `gate` runs under the group locks and must not block.
    pub fn drain<F>(&self, key: &GroupKey, now: u64, mut gate: F) -> DrainPass<R>
    where
        R: Withdrawn,
        F: FnMut(&QueuedRequest<R>) -> Gate,
    {
        let mut pass = DrainPass::default();
        let component = self.component(key);
        let mut states: Vec<MutexGuard<'_, GroupState<R>>> =
            component.iter().map(|(_, group)| group.lock()).collect();

        let mut open = Vec::with_capacity(states.len());
        for ((group_key, _), state) in component.iter().zip(states.iter_mut()) {
            self.sweep(state, now, &mut pass);
            match state.circuit_retry_at {
                Some(until) if now < until => {
                    if group_key == key {
                        pass.blocked = Some(Blocked::Circuit { until });
                    }
                    open.push(false);
                }
                _ => {
                    state.circuit_retry_at = None;
                    open.push(true);
                }
            }
        }

        let mut ready: Vec<(Priority, u64, usize)> = Vec::new();
        for (slot, state) in states.iter().enumerate().filter(|(slot, _)| open[*slot]) {
            for priority in Priority::ALL {
                ready.extend(
                    state.tiers[priority.index()]
                        .iter()
                        .filter(|(_, request)| request.not_before <= now)
                        .map(|(seq, _)| (priority, *seq, slot)),
                );
            }
        }
        ready.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut held: BTreeSet<&str> = BTreeSet::new();
        for (priority, seq, slot) in ready {
            let group_key = &component[slot].0;
            if !open[slot] || group_key.iter().any(|name| held.contains(name.as_str())) {
                continue;
            }
            let index = priority.index();
            let verdict = match states[slot].tiers[index].get(&seq) {
                Some(request) => gate(request),
                None => continue,
            };
            match verdict {
                Gate::Admit => {
                    if let Some(request) = states[slot].tiers[index].remove(&seq) {
                        self.depth[index].fetch_sub(1, Ordering::AcqRel);
                        pass.admitted.push(request);
                    }
                }
                Gate::QuotaExhausted { wait } => {
                    held.extend(group_key.iter().map(String::as_str));
                    pass.blocked.get_or_insert(Blocked::Quota { wait });
                }
                Gate::CircuitOpen => {
                    let until = now.saturating_add(self.circuit_backoff);
                    states[slot].circuit_retry_at = Some(until);
                    open[slot] = false;
                    pass.blocked.get_or_insert(Blocked::Circuit { until });
                }
            }
        }
        pass
    }

    /// Take one queued request out of `key`'s group, wherever it sits.
    pub fn remove(&self, key: &GroupKey, id: RequestId) -> Option<QueuedRequest<R>> {
        let group = self.group(key)?;
        let mut state = group.lock();
        for (index, tier) in state.tiers.iter_mut().enumerate() {
            let seq = tier.iter().find(|(_, request)| request.id == id).map(|(seq, _)| *seq);
            if let Some(request) = seq.and_then(|seq| tier.remove(&seq)) {
                self.depth[index].fetch_sub(1, Ordering::AcqRel);
                return Some(request);
            }
        }
        None
    }

    /// Whether a request at `priority` needing `buckets` has to queue behind one already
    /// waiting at the same or a higher tier on any of those buckets.
    pub fn has_waiting_ahead<S: AsRef<str>>(&self, buckets: &[S], priority: Priority) -> bool {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        groups
            .iter()
            .filter(|(key, _)| {
                key.iter().any(|name| buckets.iter().any(|b| b.as_ref() == name.as_str()))
            })
            .any(|(_, group)| {
                let state = group.lock();
                Priority::ALL
                    .into_iter()
                    .filter(|tier| *tier >= priority)
                    .any(|tier| !state.tiers[tier.index()].is_empty())
            })
    }

    /// Lift the circuit backoff on every group that needs `bucket` and wake them.
    pub fn clear_circuit_backoff(&self, bucket: &str) -> usize {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut woken = 0;
        for (key, group) in groups.iter() {
            if !key.iter().any(|name| name == bucket) {
                continue;
            }
            if group.lock().circuit_retry_at.take().is_some() {
                group.notify.notify_one();
                woken += 1;
            }
        }
        woken
    }

    /// Remove every queued request, highest tier first.
    pub fn take_all(&self) -> Vec<QueuedRequest<R>> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        for group in groups.values() {
            let mut state = group.lock();
            for priority in Priority::ALL {
                let index = priority.index();
                let tier = std::mem::take(&mut state.tiers[index]);
                self.depth[index].fetch_sub(tier.len(), Ordering::AcqRel);
                out.extend(tier.into_values());
            }
        }
        out
    }

    /// Queued requests in one tier across all groups.
    pub fn depth(&self, priority: Priority) -> usize {
        self.depth[priority.index()].load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.depth.iter().map(|d| d.load(Ordering::Acquire)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn group_keys(&self) -> Vec<GroupKey> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Requests queued in one group, summed over tiers.
    pub fn group_len(&self, key: &GroupKey) -> usize {
        self.group(key).map_or(0, |group| group.lock().tiers.iter().map(BTreeMap::len).sum())
    }

    fn full_tier_at_or_above(&self, priority: Priority) -> Option<Priority> {
        Priority::ALL
            .into_iter()
            .filter(|tier| *tier > priority)
            .find(|tier| self.depth(*tier) >= self.capacity)
    }

    fn reserve(&self, priority: Priority) -> bool {
        let capacity = self.capacity;
        self.depth[priority.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < capacity).then_some(depth + 1)
            })
            .is_ok()
    }

    fn sweep(&self, state: &mut GroupState<R>, now: u64, pass: &mut DrainPass<R>)
    where
        R: Withdrawn,
    {
        for (index, tier) in state.tiers.iter_mut().enumerate() {
            let doomed: Vec<(u64, bool)> = tier
                .iter()
                .filter_map(|(seq, request)| {
                    if request.payload.is_withdrawn() {
                        Some((*seq, true))
                    } else if now >= request.deadline || request.attempts >= self.max_attempts {
                        Some((*seq, false))
                    } else {
                        None
                    }
                })
                .collect();
            for (seq, withdrawn) in doomed {
                if let Some(request) = tier.remove(&seq) {
                    self.depth[index].fetch_sub(1, Ordering::AcqRel);
                    if withdrawn {
                        pass.withdrawn.push(request);
                    } else {
                        pass.expired.push(request);
                    }
                }
            }
        }
    }

    /// `key`'s group plus every group reachable from it through shared buckets, in key order.
    fn component(&self, key: &GroupKey) -> Vec<(GroupKey, Arc<Group<R>>)> {
        let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
        if !groups.contains_key(key) {
            return Vec::new();
        }
        let mut buckets: BTreeSet<String> = key.iter().cloned().collect();
        let mut members: BTreeMap<GroupKey, Arc<Group<R>>> = BTreeMap::new();
        loop {
            let before = members.len();
            for (candidate, group) in groups.iter() {
                if members.contains_key(candidate)
                    || !candidate.iter().any(|name| buckets.contains(name))
                {
                    continue;
                }
                buckets.extend(candidate.iter().cloned());
                members.insert(candidate.clone(), group.clone());
            }
            if members.len() == before {
                break;
            }
        }
        members.into_iter().collect()
    }

    fn group(&self, key: &GroupKey) -> Option<Arc<Group<R>>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn group_or_insert(&self, key: &GroupKey) -> Arc<Group<R>> {
        if let Some(group) = self.group(key) {
            return group;
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Group {
                    state: Mutex::new(GroupState {
                        tiers: Default::default(),
                        circuit_retry_at: None,
                    }),
                    notify: Arc::new(Notify::new()),
                })
            })
            .clone()
    }
}
