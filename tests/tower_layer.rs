use ratewarden::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};

#[derive(Debug, Clone, PartialEq)]
struct MatchRequest {
    id: u64,
    background: bool,
}

fn route(req: &MatchRequest) -> Route {
    let priority = if req.background { Priority::Background } else { Priority::Interactive };
    Route::new(format!("match:{}", req.id), ["global", "matchHistory"]).priority(priority)
}

#[tokio::test(start_paused = true)]
async fn layered_service_is_paced_by_the_quota() {
    let config = CoordinatorConfig::default()
        .with_bucket("global", 100, Duration::from_secs(1))
        .with_bucket("matchHistory", 1, Duration::from_secs(1));
    let coordinator: Coordinator<String, String> = Coordinator::new(config).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let svc = ServiceBuilder::new().layer(AdmissionLayer::new(coordinator.clone(), route)).service(
        service_fn(move |req: MatchRequest| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(format!("match {}", req.id)) }
        }),
    );

    let start = tokio::time::Instant::now();
    let calls_out = (1..=3).map(|id| svc.clone().oneshot(MatchRequest { id, background: false }));
    let results = futures::future::join_all(calls_out).await;

    let results: Vec<String> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(results, ["match 1", "match 2", "match 3"]);
    assert!(start.elapsed() >= Duration::from_secs(2), "one call per window");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Cached now: no inner call and no waiting.
    let before = tokio::time::Instant::now();
    let cached = svc.oneshot(MatchRequest { id: 2, background: true }).await.unwrap();
    assert_eq!(cached, "match 2");
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn backpressure_surfaces_as_queue_full() {
    let clock = ManualClock::new();
    let queue = QueueConfig { max_size_per_tier: 1, ..Default::default() };
    let config = CoordinatorConfig::default()
        .with_bucket("global", 1, Duration::from_secs(60))
        .with_bucket("matchHistory", 1, Duration::from_secs(60))
        .with_queue(queue);
    let coordinator: Coordinator<String, String> =
        Coordinator::builder(config).clock(clock.clone()).manual().build().unwrap();

    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(coordinator.clone(), route))
        .service(service_fn(|req: MatchRequest| async move {
            Ok::<_, String>(format!("match {}", req.id))
        }));

    let first = svc.clone().oneshot(MatchRequest { id: 1, background: false }).await;
    assert_eq!(first.unwrap(), "match 1");

    // Occupies the only interactive slot; its future stays pending until drained.
    let waiting = tokio::spawn(svc.clone().oneshot(MatchRequest { id: 2, background: false }));
    while coordinator.queued_len() == 0 {
        tokio::task::yield_now().await;
    }

    let err = svc.oneshot(MatchRequest { id: 3, background: false }).await.unwrap_err();
    assert!(err.is_queue_full());

    clock.advance(Duration::from_secs(60));
    assert_eq!(coordinator.drain_now().await, 1);
    assert_eq!(waiting.await.unwrap().unwrap(), "match 2");
}
