//! Error types for the coordinator
use crate::scheduler::Priority;
use std::fmt;
use std::time::Duration;

/// Unified error type surfaced by the coordinator, generic over the upstream error `E`.
///
/// Only [`QueueFull`](Self::QueueFull) and [`InvalidRequest`](Self::InvalidRequest) are returned
/// directly from `submit`; `Upstream`, `Expired` and `Cancelled` arrive through a completion
/// handle.
///
/// [`QuotaExceeded`](Self::QuotaExceeded) and [`CircuitOpen`](Self::CircuitOpen) complete the
/// taxonomy but are never delivered by the coordinator: both conditions are absorbed by
/// queueing. They remain public so callers matching on the full taxonomy, and wrappers that
/// gate on a [`QuotaLedger`](crate::quota::QuotaLedger) or
/// [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker) directly, have variants to use.
#[derive(Debug, Clone)]
pub enum CoordinatorError<E> {
    /// A named bucket had no capacity left. Never delivered by the coordinator.
    QuotaExceeded { bucket: String, retry_after: Duration },
    /// The breaker guarding a bucket is open. Never delivered by the coordinator.
    CircuitOpen { bucket: String },
    /// The tier (or a higher one) is at capacity; the submission was not queued.
    QueueFull { priority: Priority, capacity: usize },
    /// The caller-supplied operation failed and no retry budget remains.
    Upstream { error: E, attempts: u32 },
    /// The request outlived its deadline (or attempt budget) while queued.
    Expired { waited: Duration, attempts: u32 },
    /// The caller withdrew interest before the request executed.
    Cancelled,
    /// The request named no buckets, or a bucket the ledger does not know.
    InvalidRequest { reason: String },
}

impl<E: fmt::Display> fmt::Display for CoordinatorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded { bucket, retry_after } => {
                write!(f, "quota exhausted for bucket '{}' (retry in {:?})", bucket, retry_after)
            }
            Self::CircuitOpen { bucket } => {
                write!(f, "circuit breaker open for bucket '{}'", bucket)
            }
            Self::QueueFull { priority, capacity } => {
                write!(f, "admission queue full for {} tier (capacity {})", priority, capacity)
            }
            Self::Upstream { error, attempts } => {
                write!(f, "upstream failed after {} attempt(s): {}", attempts, error)
            }
            Self::Expired { waited, attempts } => {
                write!(f, "request expired after {:?} queued ({} attempt(s))", waited, attempts)
            }
            Self::Cancelled => write!(f, "request cancelled"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {}", reason),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CoordinatorError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl<E> CoordinatorError<E> {
    /// Check if the submission was rejected for backpressure.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
    /// Check if the request expired while queued.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
    /// Check if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
    /// Check if this wraps an upstream failure.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }
    /// Check if this is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// Check if this is a quota rejection.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
    /// Check if the request itself was malformed.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. })
    }

    /// True for conditions the coordinator retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::CircuitOpen { .. })
    }

    /// Get the upstream error if this is an `Upstream` variant.
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Borrow the upstream error if present.
    pub fn as_upstream(&self) -> Option<&E> {
        match self {
            Self::Upstream { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Number of upstream executions attempted, where known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Upstream { attempts, .. } | Self::Expired { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Errors produced when validating coordinator configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bucket name must not be empty")]
    EmptyBucketName,
    #[error("bucket '{0}' is configured more than once")]
    DuplicateBucket(String),
    #[error("bucket '{name}': max_requests must be > 0")]
    InvalidMaxRequests { name: String },
    #[error("bucket '{name}': window must be > 0")]
    InvalidWindow { name: String },
    #[error("unknown bucket '{0}'")]
    UnknownBucket(String),
    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
    #[error("hot-key demotion_threshold ({demotion}) must not exceed threshold ({promotion})")]
    DemotionAbovePromotion { promotion: u64, demotion: u64 },
    #[error("retry_backoff_max ({max:?}) must be >= retry_backoff ({base:?})")]
    BackoffMaxBelowBase { base: Duration, max: Duration },
    #[error("worker loops need a running tokio runtime")]
    RuntimeUnavailable,
    #[error("invalid configuration document: {0}")]
    Parse(String),
}
