//! Model selection benchmarks
//!
//! - Full leaderboard vs bounded top-k over a growing run history
//! - Streaming best-by-metric baseline
//! - Metric computation on a validation partition
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trueno_sweep::metrics::{MetricKind, MetricReport};
use trueno_sweep::repository::{MemoryRunRepository, RunFilter, RunRecord, RunRepository};
use trueno_sweep::selector::{Direction, MetricCriterion, ModelSelector, SelectionScope};

/// Repository with `num_runs` succeeded runs and tie-prone metrics
#[allow(clippy::cast_precision_loss)]
fn create_test_repository(num_runs: usize) -> MemoryRunRepository {
    let repo = MemoryRunRepository::new();
    for i in 0..num_runs {
        let record = RunRecord::builder(format!("run-{i:07}"), "bench-sweep", format!("exp-{i:07}"))
            .store_context(if i % 2 == 0 { "A" } else { "B" })
            .metric("val.rmse", ((i * 7_919) % 1_000) as f64 / 100.0)
            .metric("val.r2", ((i * 104_729) % 1_000) as f64 / 1_000.0)
            .completed_at(Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap())
            .build();
        repo.append(record).unwrap();
    }
    repo
}

fn criteria() -> Vec<MetricCriterion> {
    vec![
        MetricCriterion::new("val.rmse", Direction::Minimize, 0),
        MetricCriterion::new("val.r2", Direction::Maximize, 1),
    ]
}

/// Benchmark full ranking vs bounded top-10
fn bench_leaderboard(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaderboard");
    let scope = SelectionScope::execution("bench-sweep");
    let criteria = criteria();
    let selector = ModelSelector::new();

    for size in [1_000, 10_000, 50_000].iter() {
        let repo = create_test_repository(*size);

        group.bench_with_input(BenchmarkId::new("full", size), size, |b, _| {
            b.iter(|| {
                let ranked = selector.leaderboard(&repo, &scope, &criteria, None).unwrap();
                black_box(ranked);
            });
        });

        group.bench_with_input(BenchmarkId::new("top10", size), size, |b, _| {
            b.iter(|| {
                let ranked = selector.leaderboard(&repo, &scope, &criteria, Some(10)).unwrap();
                black_box(ranked);
            });
        });
    }

    group.finish();
}

/// Benchmark single-metric streaming best
fn bench_best_by_metric(c: &mut Criterion) {
    let mut group = c.benchmark_group("best_by_metric");
    let filter = RunFilter::new().store_context("A");

    for size in [1_000, 10_000, 50_000].iter() {
        let repo = create_test_repository(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let best = repo
                    .best_by_metric(&filter, "val.rmse", Direction::Minimize)
                    .unwrap();
                black_box(best);
            });
        });
    }

    group.finish();
}

/// Benchmark the full metric set on one partition
#[allow(clippy::cast_precision_loss)]
fn bench_metric_report(c: &mut Criterion) {
    let mut group = c.benchmark_group("metric_report");

    for size in [100, 1_000, 10_000].iter() {
        let actual: Vec<f64> = (0..*size).map(|i| 10.0 + (i % 17) as f64).collect();
        let predicted: Vec<f64> = actual.iter().map(|v| v * 1.05).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut report = MetricReport::new();
                report.evaluate("val", &MetricKind::ALL, &actual, &predicted);
                black_box(report);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_leaderboard,
    bench_best_by_metric,
    bench_metric_report
);
criterion_main!(benches);
