use ratewarden::prelude::*;
use ratewarden::telemetry::RequestEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Coord = Coordinator<String, String>;

fn manual(clock: &ManualClock, config: CoordinatorConfig) -> Coord {
    Coordinator::builder(config).clock(clock.clone()).manual().build().unwrap()
}

/// Upstream stub that appends `label` to a shared log when it runs.
fn recording(
    log: &Arc<Mutex<Vec<String>>>,
    label: &str,
) -> impl Fn() -> futures::future::Ready<Result<String, String>> + Send + Sync + 'static {
    let log = log.clone();
    let label = label.to_string();
    move || {
        log.lock().unwrap().push(label.clone());
        futures::future::ready(Ok(label.clone()))
    }
}

#[tokio::test(start_paused = true)]
async fn third_request_waits_for_the_next_window() {
    let config =
        CoordinatorConfig::default().with_bucket("summonerLookup", 2, Duration::from_secs(1));
    let coordinator = Coord::new(config).unwrap();
    let start = tokio::time::Instant::now();
    let ran_at = Arc::new(Mutex::new(Vec::new()));

    let submissions = (0..3).map(|i| {
        let coordinator = coordinator.clone();
        let ran_at = ran_at.clone();
        async move {
            let request = Request::new(format!("summoner:{i}"), ["summonerLookup"], move || {
                ran_at.lock().unwrap().push(tokio::time::Instant::now());
                futures::future::ready(Ok::<_, String>(format!("summoner {i}")))
            });
            coordinator.submit_request(request).await.unwrap()
        }
    });
    let handles = futures::future::join_all(submissions).await;
    assert_eq!(coordinator.queued_len(), 1);

    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.wait().await.unwrap(), format!("summoner {i}"));
    }

    let ran_at = ran_at.lock().unwrap().clone();
    assert_eq!(ran_at.len(), 3);
    assert!(ran_at[0] - start < Duration::from_millis(100));
    assert!(ran_at[1] - start < Duration::from_millis(100));
    assert!(ran_at[2] - start >= Duration::from_secs(1), "third ran in the first window");
}

#[tokio::test]
async fn higher_tiers_drain_first_and_fifo_within_a_tier() {
    let clock = ManualClock::new();
    let coordinator =
        manual(&clock, CoordinatorConfig::default().with_bucket("a", 1, Duration::from_secs(1)));
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("k0", ["a"], Priority::Interactive, recording(&log, "k0")).await.unwrap();
    let order = [
        ("bg1", Priority::Background),
        ("refresh1", Priority::Refresh),
        ("int1", Priority::Interactive),
        ("bg2", Priority::Background),
        ("int2", Priority::Interactive),
    ];
    let mut handles = Vec::new();
    for (key, priority) in order {
        let handle = coordinator.submit(key, ["a"], priority, recording(&log, key)).await.unwrap();
        handles.push(handle);
    }
    assert_eq!(coordinator.queue_depth(Priority::Interactive), 2);
    assert_eq!(coordinator.queue_depth(Priority::Refresh), 1);
    assert_eq!(coordinator.queue_depth(Priority::Background), 2);

    for _ in 0..order.len() {
        clock.advance(Duration::from_secs(1));
        assert_eq!(coordinator.drain_now().await, 1);
    }
    for handle in &handles {
        assert!(handle.is_resolved());
    }
    assert_eq!(*log.lock().unwrap(), ["k0", "int1", "int2", "refresh1", "bg1", "bg2"]);
}

#[tokio::test]
async fn full_tier_rejects_new_submissions() {
    let clock = ManualClock::new();
    let queue = QueueConfig { max_size_per_tier: 2, ..Default::default() };
    let config = CoordinatorConfig::default()
        .with_bucket("a", 1, Duration::from_secs(60))
        .with_queue(queue);
    let coordinator = manual(&clock, config);
    let log = Arc::new(Mutex::new(Vec::new()));

    for key in ["k0", "k1", "k2"] {
        coordinator.submit(key, ["a"], Priority::Interactive, recording(&log, key)).await.unwrap();
    }
    assert_eq!(coordinator.queue_depth(Priority::Interactive), 2);

    let err = coordinator
        .submit("k3", ["a"], Priority::Interactive, recording(&log, "k3"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::QueueFull { priority: Priority::Interactive, capacity: 2 }
    ));

    // A full higher tier also turns away lower tiers.
    let err = coordinator
        .submit("k4", ["a"], Priority::Background, recording(&log, "k4"))
        .await
        .unwrap_err();
    assert!(err.is_queue_full());
    assert_eq!(coordinator.queued_len(), 2);
}

#[tokio::test]
async fn queued_request_expires_after_max_age() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let config = CoordinatorConfig::default().with_bucket("a", 1, Duration::from_secs(10));
    let coordinator = Coord::builder(config)
        .clock(clock.clone())
        .telemetry(sink.clone())
        .manual()
        .build()
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("k0", ["a"], Priority::Interactive, recording(&log, "k0")).await.unwrap();
    let request = Request::new("k1", ["a"], recording(&log, "k1")).max_age(Duration::from_secs(1));
    let handle = coordinator.submit_request(request).await.unwrap();

    clock.advance(Duration::from_millis(1_500));
    assert_eq!(coordinator.drain_now().await, 0);

    match handle.wait().await {
        Err(CoordinatorError::Expired { waited, attempts }) => {
            assert_eq!(waited, Duration::from_millis(1_500));
            assert_eq!(attempts, 0);
        }
        other => panic!("expected expiry, got {other:?}"),
    }
    assert_eq!(*log.lock().unwrap(), ["k0"]);
    let expired = sink.events().into_iter().any(|event| match event {
        CoordinatorEvent::Request(RequestEvent::Expired { key, .. }) => key == "k1",
        _ => false,
    });
    assert!(expired);
}

#[tokio::test]
async fn cancelled_handle_is_skipped_without_spending_quota() {
    let clock = ManualClock::new();
    let coordinator =
        manual(&clock, CoordinatorConfig::default().with_bucket("a", 1, Duration::from_secs(1)));
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("k0", ["a"], Priority::Interactive, recording(&log, "k0")).await.unwrap();
    let withdrawn = coordinator
        .submit("k1", ["a"], Priority::Interactive, recording(&log, "k1"))
        .await
        .unwrap();
    let kept = coordinator
        .submit("k2", ["a"], Priority::Interactive, recording(&log, "k2"))
        .await
        .unwrap();

    withdrawn.cancel();
    clock.advance(Duration::from_secs(1));
    assert_eq!(coordinator.drain_now().await, 1);

    assert!(withdrawn.wait().await.unwrap_err().is_cancelled());
    assert_eq!(kept.wait().await.unwrap(), "k2");
    assert_eq!(*log.lock().unwrap(), ["k0", "k2"]);
}

#[tokio::test]
async fn dropping_every_handle_withdraws_the_request() {
    let clock = ManualClock::new();
    let coordinator =
        manual(&clock, CoordinatorConfig::default().with_bucket("a", 1, Duration::from_secs(1)));
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("k0", ["a"], Priority::Interactive, recording(&log, "k0")).await.unwrap();
    drop(coordinator.submit("k1", ["a"], Priority::Interactive, recording(&log, "k1")).await);

    clock.advance(Duration::from_secs(1));
    assert_eq!(coordinator.drain_now().await, 0);
    assert_eq!(coordinator.queued_len(), 0);
    assert_eq!(*log.lock().unwrap(), ["k0"]);
}

#[tokio::test(start_paused = true)]
async fn failed_upstream_calls_are_retried_with_backoff() {
    let queue = QueueConfig {
        max_attempts: 3,
        retry_backoff: Duration::from_millis(200),
        retry_backoff_max: Duration::from_secs(1),
        retry_jitter: false,
        ..Default::default()
    };
    let config = CoordinatorConfig::default()
        .with_bucket("a", 10, Duration::from_secs(1))
        .with_queue(queue);
    let coordinator = Coord::new(config).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let start = tokio::time::Instant::now();
    let handle = coordinator
        .submit("flaky", ["a"], Priority::Interactive, move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok("ok".to_string())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(600), "200ms then 400ms of backoff");
}

#[tokio::test]
async fn multi_bucket_requests_spend_every_bucket() {
    let clock = ManualClock::new();
    let config = CoordinatorConfig::default()
        .with_bucket("global", 10, Duration::from_secs(1))
        .with_bucket("matchHistory", 1, Duration::from_secs(1));
    let coordinator = manual(&clock, config);
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator
        .submit("m1", ["global", "matchHistory"], Priority::Interactive, recording(&log, "m1"))
        .await
        .unwrap();
    let queued = coordinator
        .submit("m2", ["global", "matchHistory"], Priority::Interactive, recording(&log, "m2"))
        .await
        .unwrap();
    // Shares only "global", so it is not stuck behind the match-history group.
    let other = coordinator
        .submit("s1", ["global"], Priority::Interactive, recording(&log, "s1"))
        .await
        .unwrap();

    assert!(!queued.is_resolved());
    assert_eq!(other.wait().await.unwrap(), "s1");
    assert_eq!(coordinator.get_quota_status("global").unwrap().used, 2);
    assert_eq!(coordinator.get_quota_status("matchHistory").unwrap().used, 1);

    clock.advance(Duration::from_secs(1));
    coordinator.drain_now().await;
    assert_eq!(queued.wait().await.unwrap(), "m2");
}

#[tokio::test]
async fn bucket_limits_can_change_at_runtime() {
    let clock = ManualClock::new();
    let coordinator =
        manual(&clock, CoordinatorConfig::default().with_bucket("a", 1, Duration::from_secs(60)));
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("k0", ["a"], Priority::Interactive, recording(&log, "k0")).await.unwrap();
    let queued = coordinator
        .submit("k1", ["a"], Priority::Interactive, recording(&log, "k1"))
        .await
        .unwrap();
    assert!(!queued.is_resolved());

    coordinator.set_bucket_limits("a", 5, Duration::from_secs(60)).unwrap();
    assert_eq!(coordinator.drain_now().await, 1);
    assert_eq!(queued.wait().await.unwrap(), "k1");
    assert_eq!(coordinator.get_quota_status("a").unwrap().remaining, 3);

    assert!(coordinator.set_bucket_limits("missing", 5, Duration::from_secs(1)).is_err());
    coordinator.add_bucket(BucketConfig::new("late", 1, Duration::from_secs(1)).unwrap()).unwrap();
    let late = coordinator
        .submit("k2", ["late"], Priority::Interactive, recording(&log, "k2"))
        .await
        .unwrap();
    assert_eq!(late.wait().await.unwrap(), "k2");
}

#[tokio::test]
async fn shared_bucket_goes_to_the_higher_tier_across_bucket_sets() {
    let clock = ManualClock::new();
    let config = CoordinatorConfig::default()
        .with_bucket("a", 1, Duration::from_secs(1))
        .with_bucket("b", 10, Duration::from_secs(1));
    let coordinator = manual(&clock, config);
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("x", ["a"], Priority::Interactive, recording(&log, "x")).await.unwrap();
    let hi =
        coordinator.submit("hi", ["a", "b"], Priority::Interactive, recording(&log, "hi")).await;
    let lo = coordinator.submit("lo", ["a"], Priority::Background, recording(&log, "lo")).await;
    let (hi, lo) = (hi.unwrap(), lo.unwrap());
    assert_eq!(coordinator.queued_len(), 2);

    clock.advance(Duration::from_secs(1));
    assert_eq!(coordinator.drain_now().await, 1);
    assert_eq!(hi.wait().await.unwrap(), "hi");
    assert!(!lo.is_resolved());

    clock.advance(Duration::from_secs(1));
    assert_eq!(coordinator.drain_now().await, 1);
    assert_eq!(lo.wait().await.unwrap(), "lo");
    assert_eq!(*log.lock().unwrap(), ["x", "hi", "lo"]);
}

#[tokio::test]
async fn shared_bucket_is_fifo_within_a_tier_across_bucket_sets() {
    let clock = ManualClock::new();
    let config = CoordinatorConfig::default()
        .with_bucket("a", 1, Duration::from_secs(1))
        .with_bucket("b", 10, Duration::from_secs(1));
    let coordinator = manual(&clock, config);
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("x", ["a"], Priority::Interactive, recording(&log, "x")).await.unwrap();
    let waiting: [(&str, &[&str]); 3] =
        [("first", &["a", "b"]), ("second", &["a"]), ("third", &["b"])];
    for (key, buckets) in waiting {
        let buckets = buckets.iter().copied();
        let handle = coordinator.submit(key, buckets, Priority::Interactive, recording(&log, key));
        handle.await.unwrap();
    }
    // `third` only needs `b`, but it must not jump the requests waiting on `b`.
    assert_eq!(coordinator.queued_len(), 3);

    for _ in 0..2 {
        clock.advance(Duration::from_secs(1));
        coordinator.drain_now().await;
    }
    assert_eq!(coordinator.queued_len(), 0);
    assert_eq!(*log.lock().unwrap(), ["x", "first", "third", "second"]);
}

#[tokio::test]
async fn cancelling_by_id_frees_the_queue_slot() {
    let clock = ManualClock::new();
    let queue = QueueConfig { max_size_per_tier: 1, ..Default::default() };
    let config = CoordinatorConfig::default()
        .with_bucket("a", 1, Duration::from_secs(60))
        .with_queue(queue);
    let coordinator = manual(&clock, config);
    let log = Arc::new(Mutex::new(Vec::new()));

    coordinator.submit("k0", ["a"], Priority::Interactive, recording(&log, "k0")).await.unwrap();
    let queued = coordinator
        .submit("k1", ["a"], Priority::Interactive, recording(&log, "k1"))
        .await
        .unwrap();
    assert!(coordinator.cancel(queued.id()));
    assert_eq!(coordinator.queued_len(), 0);

    let next = coordinator.submit("k2", ["a"], Priority::Interactive, recording(&log, "k2")).await;
    assert!(next.is_ok(), "the cancelled request no longer holds the only slot");
    assert_eq!(coordinator.queue_depth(Priority::Interactive), 1);
}
