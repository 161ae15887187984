#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratewarden
//!
//! Quota-aware access to a single rate-limited upstream API.
//!
//! ## Features
//!
//! - **Quota ledger** with fixed windows per named bucket and all-or-nothing admission
//! - **Two-tier cache**: a bounded local LRU in front of a pluggable shared tier
//! - **Hot-key tracking** that promotes frequently missed keys to proactive refresh
//! - **Per-bucket circuit breakers** with half-open probing
//! - **Priority admission queue** with per-tier backpressure, deadlines, and FIFO within a tier
//! - **Structured telemetry** through `tracing` and pluggable tower-service sinks
//! - **Tower layer** that puts any `Service` behind the coordinator
//!
//! ## Quick Start
//!
//! ```rust
//! use ratewarden::{Coordinator, CoordinatorConfig, Priority};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CoordinatorConfig::default()
//!         .with_bucket("global", 100, Duration::from_secs(1))
//!         .with_bucket("summonerLookup", 20, Duration::from_secs(1));
//!     let coordinator = Coordinator::<u64, String>::new(config).expect("valid config");
//!
//!     let handle = coordinator
//!         .submit("summoner:faker", ["global", "summonerLookup"], Priority::Interactive, || {
//!             async { Ok(7) }
//!         })
//!         .await
//!         .expect("admitted or queued");
//!     assert_eq!(handle.wait().await.unwrap(), 7);
//!
//!     // Served from cache: no quota spent.
//!     let again = coordinator
//!         .submit("summoner:faker", ["global", "summonerLookup"], Priority::Interactive, || {
//!             async { Ok(8) }
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(again.wait().await.unwrap(), 7);
//!     assert_eq!(coordinator.get_quota_status("global").unwrap().used, 1);
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hot_keys;
pub mod layer;
pub mod prelude;
pub mod quota;
pub mod scheduler;
pub mod telemetry;

// Re-exports
pub use cache::{CacheLayer, CacheStats, InMemorySharedTier, SharedTier};
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus};
pub use clock::{Clock, ManualClock, MonotonicClock, TokioClock};
pub use completion::CompletionHandle;
pub use config::{
    BucketConfig, CacheConfig, CircuitConfig, CoordinatorConfig, HotKeyConfig, QueueConfig,
};
pub use coordinator::{Coordinator, CoordinatorBuilder, Request};
pub use error::{ConfigError, CoordinatorError};
pub use hot_keys::HotKeyTracker;
pub use layer::{AdmissionLayer, AdmissionService, Route};
pub use quota::{QuotaLedger, QuotaStatus};
pub use scheduler::{Priority, RequestId};
pub use telemetry::{CoordinatorEvent, LogSink, MemorySink, NullSink, TelemetrySink};
