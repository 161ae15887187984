//! Structured telemetry for the coordinator.
//!
//! Components emit [`CoordinatorEvent`]s into a [`TelemetrySink`], which is any
//! `tower::Service<CoordinatorEvent>`. Emission is best effort: a sink that is not ready
//! immediately loses the event rather than stalling a caller or a worker loop.
//!
//! ```rust
//! use ratewarden::telemetry::{CoordinatorEvent, HotKeyEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(CoordinatorEvent::HotKey(HotKeyEvent::Promoted { key: "summoner:faker".into() }))
//!     .await
//!     .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

pub mod events;
pub mod sinks;

pub use events::{
    CacheTier, CircuitEvent, CoordinatorEvent, HotKeyEvent, QuotaEvent, RequestEvent,
};
pub(crate) use sinks::Emitter;
pub use sinks::{LogSink, MemorySink, NullSink, TelemetrySink};
