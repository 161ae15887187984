use super::events::CoordinatorEvent;
use futures::FutureExt;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// A telemetry sink that consumes coordinator events.
///
/// Any `tower::Service<CoordinatorEvent>` that is `Clone + Send` qualifies, so sinks compose with
/// ordinary tower middleware.
pub trait TelemetrySink:
    Service<CoordinatorEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<CoordinatorEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: CoordinatorEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event at INFO through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<CoordinatorEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinatorEvent) -> Self::Future {
        tracing::info!(event = %event, "coordinator_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past `capacity`. Meant for tests.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<CoordinatorEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink holding up to 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<CoordinatorEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CoordinatorEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<CoordinatorEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: CoordinatorEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased sink held by the coordinator.
pub(crate) struct Emitter {
    sink: Mutex<BoxCloneService<CoordinatorEvent, (), BoxError>>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

impl Emitter {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let sink = sink.map_err(|error: S::SinkError| -> BoxError { Box::new(error) });
        Self { sink: Mutex::new(BoxCloneService::new(sink)) }
    }

    /// Best-effort delivery that never waits.
    ///
    /// A sink that is not ready right away loses the event. An unfinished sink future is spawned
    /// onto the current runtime when there is one, and dropped otherwise.
    pub(crate) fn emit(&self, event: CoordinatorEvent) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let ready = match sink.ready().now_or_never() {
            Some(Ok(_)) => true,
            Some(Err(_)) | None => false,
        };
        if !ready {
            tracing::trace!(event = %event, "telemetry sink not ready; event dropped");
            return;
        }
        let mut fut = sink.call(event);
        if fut.as_mut().now_or_never().is_some() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = fut.await;
            });
        }
    }
}
