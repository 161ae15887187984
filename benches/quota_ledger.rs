use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ratewarden::config::BucketConfig;
use ratewarden::quota::QuotaLedger;
use ratewarden::{Coordinator, CoordinatorConfig, MonotonicClock, Priority};

use std::sync::Arc;
use std::time::Duration;

fn ledger() -> QuotaLedger {
    let buckets = [
        BucketConfig::new("global", u32::MAX, Duration::from_secs(1)).unwrap(),
        BucketConfig::new("summonerLookup", u32::MAX, Duration::from_secs(1)).unwrap(),
        BucketConfig::new("matchHistory", u32::MAX, Duration::from_secs(1)).unwrap(),
    ];
    QuotaLedger::with_buckets(Arc::new(MonotonicClock::default()), &buckets).unwrap()
}

fn quota_acquire_single_bucket(c: &mut Criterion) {
    let ledger = ledger();
    c.bench_function("quota_acquire_single_bucket", |b| {
        b.iter(|| black_box(ledger.acquire(black_box(&["global"][..]))));
    });
}

fn quota_acquire_three_buckets(c: &mut Criterion) {
    let ledger = ledger();
    c.bench_function("quota_acquire_three_buckets", |b| {
        b.iter(|| {
            black_box(ledger.acquire(black_box(&["global", "summonerLookup", "matchHistory"][..])))
        });
    });
}

fn coordinator_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config =
        CoordinatorConfig::default().with_bucket("summonerLookup", 1_000, Duration::from_secs(1));
    let coordinator = rt.block_on(async {
        let coordinator = Coordinator::<u64, String>::new(config).unwrap();
        // Warm the cache so every iteration is a local hit.
        coordinator
            .submit("summoner:faker", ["summonerLookup"], Priority::Interactive, || async {
                Ok(7)
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        coordinator
    });

    c.bench_function("coordinator_submit_cache_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = coordinator
                .submit("summoner:faker", ["summonerLookup"], Priority::Interactive, || async {
                    Ok(0)
                })
                .await
                .unwrap();
            black_box(handle.wait().await)
        });
    });
}

criterion_group!(
    benches,
    quota_acquire_single_bucket,
    quota_acquire_three_buckets,
    coordinator_cache_hit
);
criterion_main!(benches);
