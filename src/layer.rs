//! Tower integration: route every call of an inner service through a [`Coordinator`].
//!
//! A classifier maps each request to a cache key, the buckets it spends, and a priority. The
//! inner service only runs when the coordinator admits the request; cache hits never reach it.
//!
//! ```rust
//! use ratewarden::layer::{AdmissionLayer, Route};
//! use ratewarden::{Coordinator, CoordinatorConfig};
//! use std::time::Duration;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CoordinatorConfig::default().with_bucket("matches", 10, Duration::from_secs(1));
//! let coordinator = Coordinator::<String, String>::new(config).unwrap();
//!
//! let route = |id: &u64| Route::new(format!("match:{id}"), ["matches"]);
//! let svc = ServiceBuilder::new()
//!     .layer(AdmissionLayer::new(coordinator, route))
//!     .service(service_fn(|id: u64| async move { Ok::<_, String>(format!("match {id}")) }));
//!
//! assert_eq!(svc.oneshot(42u64).await.unwrap(), "match 42");
//! # }
//! ```

use crate::coordinator::{Coordinator, Request};
use crate::error::CoordinatorError;
use crate::scheduler::Priority;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Where a request goes: its cache key, the buckets it spends, and its tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub key: String,
    pub buckets: Vec<String>,
    pub priority: Priority,
    pub cache_ttl: Option<Duration>,
    pub no_cache: bool,
}

impl Route {
    pub fn new<B, S>(key: impl Into<String>, buckets: B) -> Self
    where
        B: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            buckets: buckets.into_iter().map(Into::into).collect(),
            priority: Priority::Interactive,
            cache_ttl: None,
            no_cache: false,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }
}

/// Layer that wraps a service in an [`AdmissionService`].
pub struct AdmissionLayer<T, E, F> {
    coordinator: Coordinator<T, E>,
    classify: Arc<F>,
}

impl<T, E, F> AdmissionLayer<T, E, F> {
    pub fn new(coordinator: Coordinator<T, E>, classify: F) -> Self {
        Self { coordinator, classify: Arc::new(classify) }
    }
}

impl<T, E, F> Clone for AdmissionLayer<T, E, F> {
    fn clone(&self) -> Self {
        Self { coordinator: self.coordinator.clone(), classify: self.classify.clone() }
    }
}

impl<T, E, F> fmt::Debug for AdmissionLayer<T, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer").finish_non_exhaustive()
    }
}

impl<S, T, E, F> Layer<S> for AdmissionLayer<T, E, F> {
    type Service = AdmissionService<S, T, E, F>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner: Arc::new(Mutex::new(inner)),
            coordinator: self.coordinator.clone(),
            classify: self.classify.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
///
/// Each upstream attempt clones the inner service and drives it with `oneshot`, so retries after
/// a failure see a fresh, ready instance.
pub struct AdmissionService<S, T, E, F> {
    inner: Arc<Mutex<S>>,
    coordinator: Coordinator<T, E>,
    classify: Arc<F>,
}

impl<S, T, E, F> Clone for AdmissionService<S, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            coordinator: self.coordinator.clone(),
            classify: self.classify.clone(),
        }
    }
}

impl<S, T, E, F> fmt::Debug for AdmissionService<S, T, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService").field("coordinator", &self.coordinator).finish()
    }
}

impl<S, Req, F> Service<Req> for AdmissionService<S, S::Response, S::Error, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Clone + Send + Sync + fmt::Debug + 'static,
    S::Error: Clone + Send + Sync + 'static,
    Req: Clone + Send + Sync + 'static,
    F: Fn(&Req) -> Route + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = CoordinatorError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    /// Always ready: backpressure is the coordinator's queue, reported as `QueueFull`.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let route = (self.classify)(&req);
        let coordinator = self.coordinator.clone();
        let inner = self.inner.clone();
        let execute = move || {
            let svc = inner.lock().unwrap_or_else(PoisonError::into_inner).clone();
            svc.oneshot(req.clone())
        };

        Box::pin(async move {
            let mut request =
                Request::new(route.key, route.buckets, execute).priority(route.priority);
            if let Some(ttl) = route.cache_ttl {
                request = request.cache_ttl(ttl);
            }
            if route.no_cache {
                request = request.no_cache();
            }
            let handle = coordinator.submit_request(request).await?;
            handle.wait().await
        })
    }
}
