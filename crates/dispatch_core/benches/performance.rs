//! Performance benchmarks for dispatch_core using Criterion.rs.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dispatch_core::geo::{GeoDistanceEngine, Position};
use dispatch_core::matching::ProximityMatcher;
use dispatch_core::test_helpers::available_driver;

fn bench_distance_engine(c: &mut Criterion) {
    let engine = GeoDistanceEngine::default();
    let a = Position::new(52.52, 13.405, 0);
    let b = Position::new(52.5, 13.39, 0);

    let mut group = c.benchmark_group("distance_engine");
    group.bench_function("uncached", |bench| {
        bench.iter(|| black_box(engine.distance_km(&a, &b, false)));
    });
    group.bench_function("cached", |bench| {
        bench.iter(|| black_box(engine.distance_km(&a, &b, true)));
    });
    group.finish();
}

fn bench_proximity_matching(c: &mut Criterion) {
    let matcher = ProximityMatcher::new(Arc::new(GeoDistanceEngine::default()));
    let pickup = Position::new(52.52, 13.405, 0);

    let mut group = c.benchmark_group("proximity_matching");
    for count in [10usize, 100, 1000] {
        // Drivers scattered on a ring around the pickup, some outside radius.
        let drivers: Vec<_> = (0..count)
            .map(|i| {
                let angle = i as f64 / count as f64 * std::f64::consts::TAU;
                let spread = 0.02 + 0.1 * (i % 7) as f64 / 7.0;
                available_driver(
                    &format!("d{i}"),
                    52.52 + spread * angle.sin(),
                    13.405 + spread * angle.cos(),
                )
            })
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(count),
            &drivers,
            |bench, drivers| {
                bench.iter(|| black_box(matcher.find_candidates(&pickup, drivers)));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_distance_engine, bench_proximity_matching);
criterion_main!(benches);
