//! Convenient re-exports for common ratewarden types.
pub use crate::{
    cache::{InMemorySharedTier, SharedTier},
    circuit_breaker::CircuitState,
    clock::{Clock, ManualClock, TokioClock},
    completion::CompletionHandle,
    config::{BucketConfig, CircuitConfig, CoordinatorConfig, HotKeyConfig, QueueConfig},
    coordinator::{Coordinator, Request},
    error::{ConfigError, CoordinatorError},
    layer::{AdmissionLayer, Route},
    quota::QuotaStatus,
    scheduler::{Priority, RequestId},
    telemetry::{CoordinatorEvent, LogSink, MemorySink, TelemetrySink},
};
