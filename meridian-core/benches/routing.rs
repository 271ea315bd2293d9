use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meridian_core::health::HealthTracker;
use meridian_core::routing::{ProviderInfo, Router, RoutingStrategy};
use std::sync::Arc;

fn providers(n: usize) -> Vec<ProviderInfo> {
    (0..n)
        .map(|i| ProviderInfo {
            name: format!("provider-{i}"),
            priority: (n - i) as i32,
            weight: (i as i64 % 3) + 1,
        })
        .collect()
}

fn bench_round_robin_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = Router::new(RoutingStrategy::RoundRobin, HealthTracker::new(Default::default()));
    let infos = providers(6);

    c.bench_function("router_select_round_robin", |b| {
        b.iter(|| rt.block_on(router.select(black_box(&infos), None)).unwrap());
    });
}

fn bench_weighted_round_robin_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = Router::new(RoutingStrategy::WeightedRoundRobin, HealthTracker::new(Default::default()));
    let infos = providers(6);

    c.bench_function("router_select_weighted_round_robin", |b| {
        b.iter(|| rt.block_on(router.select(black_box(&infos), None)).unwrap());
    });
}

fn bench_shuffle_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = Router::new(RoutingStrategy::Shuffle, HealthTracker::new(Default::default()));
    let infos = providers(6);

    c.bench_function("router_select_shuffle", |b| {
        b.iter(|| rt.block_on(router.select(black_box(&infos), None)).unwrap());
    });
}

fn bench_failover_select(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = Router::new(RoutingStrategy::Failover, HealthTracker::new(Default::default()));
    let infos = providers(6);

    c.bench_function("router_select_failover", |b| {
        b.iter(|| rt.block_on(router.select(black_box(&infos), None)).unwrap());
    });
}

fn bench_health_tracker_record(c: &mut Criterion) {
    use meridian_core::health::Outcome;
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tracker = HealthTracker::new(Default::default());

    c.bench_function("health_tracker_record_success", |b| {
        b.iter(|| rt.block_on(tracker.record(black_box("provider-0"), Outcome::Success)));
    });
}

fn bench_select_with_retry_all_healthy(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let router = Arc::new(Router::new(RoutingStrategy::Failover, HealthTracker::new(Default::default())));
    let infos = providers(4);

    c.bench_function("router_select_with_retry_primary_success", |b| {
        b.iter(|| {
            rt.block_on(async {
                let token = tokio_util::sync::CancellationToken::new();
                router
                    .select_with_retry(black_box(&infos), &token, |_info, _token| async {
                        Ok::<_, meridian_core::error::ProviderError>(())
                    })
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_round_robin_select,
    bench_weighted_round_robin_select,
    bench_shuffle_select,
    bench_failover_select,
    bench_health_tracker_record,
    bench_select_with_retry_all_healthy,
);
criterion_main!(benches);
