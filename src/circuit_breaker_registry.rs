//! Registry of per-bucket circuit breakers.
//!
//! A request gated by several buckets must pass every one of their breakers. Trial slots taken on
//! half-open breakers are tracked in a [`BreakerTicket`] so they can be handed back if a later
//! breaker (or the quota check) says no.

use crate::circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus, Permit};
use crate::clock::Clock;
use crate::config::CircuitConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Trial slots held by one admission attempt.
#[derive(Debug, Default)]
#[must_use = "release the ticket if the call does not go out"]
pub struct BreakerTicket {
    probes: Vec<CircuitBreaker>,
}

impl BreakerTicket {
    pub fn is_probe(&self) -> bool {
        !self.probes.is_empty()
    }
}

/// Why the registry refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerDenied {
    pub bucket: String,
}

/// Breakers keyed by bucket name.
#[derive(Debug)]
pub struct CircuitRegistry {
    breakers: RwLock<BTreeMap<String, CircuitBreaker>>,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { breakers: RwLock::new(BTreeMap::new()), config, clock }
    }

    /// Create a breaker for `bucket` unless one already exists.
    pub fn register(&self, bucket: &str) {
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(bucket.to_string()).or_insert_with(|| {
            CircuitBreaker::new(bucket, self.config.clone(), self.clock.clone())
        });
    }

    pub fn get(&self, bucket: &str) -> Option<CircuitBreaker> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(bucket).cloned()
    }

    pub fn state(&self, bucket: &str) -> Option<CircuitState> {
        self.get(bucket).map(|b| b.state())
    }

    pub fn status(&self, bucket: &str) -> Option<CircuitStatus> {
        self.get(bucket).map(|b| b.status())
    }

    /// Pass every named breaker or none. Unregistered names have no breaker and always pass.
    pub fn acquire<S: AsRef<str>>(&self, buckets: &[S]) -> Result<BreakerTicket, BreakerDenied> {
        let mut ticket = BreakerTicket::default();
        for breaker in self.select(buckets) {
            match breaker.acquire() {
                Permit::Closed => {}
                Permit::Probe => ticket.probes.push(breaker),
                Permit::Denied => {
                    let bucket = breaker.name().to_string();
                    self.release(ticket);
                    return Err(BreakerDenied { bucket });
                }
            }
        }
        Ok(ticket)
    }

    /// Hand back unused trial slots.
    pub fn release(&self, ticket: BreakerTicket) {
        for breaker in ticket.probes {
            breaker.release_probe();
        }
    }

    /// Record an upstream outcome against every named breaker. Returns the transitions it caused.
    pub fn record<S: AsRef<str>>(
        &self,
        buckets: &[S],
        success: bool,
    ) -> Vec<(String, CircuitState)> {
        self.select(buckets)
            .into_iter()
            .filter_map(|breaker| {
                let changed =
                    if success { breaker.record_success() } else { breaker.record_failure() };
                changed.map(|state| (breaker.name().to_string(), state))
            })
            .collect()
    }

    /// Run the OPEN -> HALF_OPEN check on every breaker; returns buckets that just went half-open.
    pub fn tick(&self) -> Vec<String> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        map.iter().filter(|(_, breaker)| breaker.tick()).map(|(name, _)| name.clone()).collect()
    }

    /// Snapshot breaker states sorted by bucket.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        map.iter().map(|(name, breaker)| (name.clone(), breaker.state())).collect()
    }

    fn select<S: AsRef<str>>(&self, buckets: &[S]) -> Vec<CircuitBreaker> {
        let wanted: BTreeSet<&str> = buckets.iter().map(AsRef::as_ref).collect();
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        wanted.into_iter().filter_map(|name| map.get(name).cloned()).collect()
    }
}
