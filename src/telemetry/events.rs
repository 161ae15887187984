use crate::scheduler::{Priority, RequestId};
use std::fmt;
use std::time::Duration;

/// Structured events emitted by the coordinator's components.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Quota(QuotaEvent),
    Circuit(CircuitEvent),
    HotKey(HotKeyEvent),
    Request(RequestEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    /// A request could not be admitted; it stays queued.
    Denied { bucket: String, wait: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    Opened { bucket: String, failures: usize },
    HalfOpen { bucket: String },
    Closed { bucket: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HotKeyEvent {
    Promoted { key: String },
    Demoted { key: String },
    /// A proactive refresh was submitted for a promoted key.
    RefreshScheduled { key: String },
}

/// Which cache tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Shared,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    CacheHit { key: String, tier: CacheTier },
    Executed { id: RequestId, key: String, attempts: u32, queued_for: Duration },
    Queued { id: RequestId, key: String, priority: Priority },
    Rejected { key: String, priority: Priority },
    Expired { id: RequestId, key: String, waited: Duration },
    Cancelled { id: RequestId, key: String },
    Failed { id: RequestId, key: String, attempts: u32, will_retry: bool },
}

impl From<QuotaEvent> for CoordinatorEvent {
    fn from(event: QuotaEvent) -> Self {
        CoordinatorEvent::Quota(event)
    }
}

impl From<CircuitEvent> for CoordinatorEvent {
    fn from(event: CircuitEvent) -> Self {
        CoordinatorEvent::Circuit(event)
    }
}

impl From<HotKeyEvent> for CoordinatorEvent {
    fn from(event: HotKeyEvent) -> Self {
        CoordinatorEvent::HotKey(event)
    }
}

impl From<RequestEvent> for CoordinatorEvent {
    fn from(event: RequestEvent) -> Self {
        CoordinatorEvent::Request(event)
    }
}

impl fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorEvent::Quota(e) => write!(f, "Quota::{}", e),
            CoordinatorEvent::Circuit(e) => write!(f, "Circuit::{}", e),
            CoordinatorEvent::HotKey(e) => write!(f, "HotKey::{}", e),
            CoordinatorEvent::Request(e) => write!(f, "Request::{}", e),
        }
    }
}

impl fmt::Display for QuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaEvent::Denied { bucket, wait } => {
                write!(f, "Denied(bucket={}, wait={:?})", bucket, wait)
            }
        }
    }
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitEvent::Opened { bucket, failures } => {
                write!(f, "Opened(bucket={}, failures={})", bucket, failures)
            }
            CircuitEvent::HalfOpen { bucket } => write!(f, "HalfOpen(bucket={})", bucket),
            CircuitEvent::Closed { bucket } => write!(f, "Closed(bucket={})", bucket),
        }
    }
}

impl fmt::Display for HotKeyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotKeyEvent::Promoted { key } => write!(f, "Promoted(key={})", key),
            HotKeyEvent::Demoted { key } => write!(f, "Demoted(key={})", key),
            HotKeyEvent::RefreshScheduled { key } => write!(f, "RefreshScheduled(key={})", key),
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Local => f.write_str("local"),
            CacheTier::Shared => f.write_str("shared"),
        }
    }
}

impl fmt::Display for RequestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestEvent::CacheHit { key, tier } => {
                write!(f, "CacheHit(key={}, tier={})", key, tier)
            }
            RequestEvent::Executed { id, key, attempts, queued_for } => write!(
                f,
                "Executed({}, key={}, attempts={}, queued_for={:?})",
                id, key, attempts, queued_for
            ),
            RequestEvent::Queued { id, key, priority } => {
                write!(f, "Queued({}, key={}, priority={})", id, key, priority)
            }
            RequestEvent::Rejected { key, priority } => {
                write!(f, "Rejected(key={}, priority={})", key, priority)
            }
            RequestEvent::Expired { id, key, waited } => {
                write!(f, "Expired({}, key={}, waited={:?})", id, key, waited)
            }
            RequestEvent::Cancelled { id, key } => write!(f, "Cancelled({}, key={})", id, key),
            RequestEvent::Failed { id, key, attempts, will_retry } => write!(
                f,
                "Failed({}, key={}, attempts={}, will_retry={})",
                id, key, attempts, will_retry
            ),
        }
    }
}
