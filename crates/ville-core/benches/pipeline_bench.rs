//! Benchmarks for the detection pipeline.
//!
//! Scoring dominates: full-history references make every scorer O(n²) over a
//! series, and the distance scorers pay an extra factor of `d`. A bounded
//! `reference_window` turns that into O(n·w). Leave-one-out bags rescore
//! every member on each step and carry the same orders.
//!
//! Run with: cargo bench -p ville-core --bench pipeline_bench
//! Parallel scoring: cargo bench -p ville-core --bench pipeline_bench --features parallel

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use ville_core::{
    BettingMartingale, ChangeDetector, ConformalBag, FeatureTable, PValueEngine, Pipeline,
    PipelineConfig, PowerMartingale, Scorer, ScorerKind, SimpleJumper, ThresholdMode,
    TieTolerance, power_martingale_cumprod, score_series,
};

/// Deterministic noise in [-1, 1] with a level shift at 3/4 of the series.
fn shifted_series(n: usize) -> Vec<f64> {
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    (0..n)
        .map(|i| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let u = (state >> 11) as f64 / (1u64 << 53) as f64;
            let shift = if i >= 3 * n / 4 { 4.0 } else { 0.0 };
            2.0 * u - 1.0 + shift
        })
        .collect()
}

fn table(n: usize, d: usize) -> FeatureTable {
    let columns = (0..d)
        .map(|j| {
            let mut column = shifted_series(n + j);
            column.truncate(n);
            (format!("f{j}"), column)
        })
        .collect();
    FeatureTable::from_columns(columns).expect("bench table")
}

// =============================================================================
// Scoring
// =============================================================================

fn bench_scorers(c: &mut Criterion) {
    let mut group = c.benchmark_group("ville/score_series");

    for n in [250usize, 1_000] {
        let data = table(n, 3);
        group.throughput(Throughput::Elements(n as u64));
        for kind in ScorerKind::ALL {
            let scorer = Scorer::from_kind(kind);
            group.bench_with_input(BenchmarkId::new(kind.name(), n), &data, |b, data| {
                b.iter(|| black_box(score_series(&scorer, data, None)))
            });
        }
        let scorer = Scorer::from_kind(ScorerKind::MinDist);
        group.bench_with_input(BenchmarkId::new("min_dist_window_50", n), &data, |b, data| {
            b.iter(|| black_box(score_series(&scorer, data, Some(50))))
        });
    }

    group.finish();
}

fn bench_conformal_bag(c: &mut Criterion) {
    let mut group = c.benchmark_group("ville/conformal_bag");

    for n in [250usize, 1_000] {
        let data = table(n, 3);
        group.throughput(Throughput::Elements(n as u64));
        for kind in [ScorerKind::MinDist, ScorerKind::MeanDist, ScorerKind::RobustMeanDev] {
            for (label, capacity) in [("full", None), ("window_50", Some(51))] {
                let id = BenchmarkId::new(format!("{}_{label}", kind.name()), n);
                group.bench_with_input(id, &data, |b, data| {
                    b.iter(|| {
                        let bag = ConformalBag::for_scorer(kind, 3, capacity).expect("bag scorer");
                        black_box(bag.series(data, TieTolerance::default(), 1))
                    })
                });
            }
        }
    }

    group.finish();
}

// =============================================================================
// P-values and martingales
// =============================================================================

fn bench_p_values(c: &mut Criterion) {
    let mut group = c.benchmark_group("ville/p_values");

    for n in [1_000usize, 5_000] {
        let scores: Vec<f64> = shifted_series(n).iter().map(|x| x.abs()).collect();
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("full_history", n), &scores, |b, s| {
            let engine = PValueEngine::new(None, TieTolerance::default(), 1);
            b.iter(|| black_box(engine.p_values(s)))
        });
        group.bench_with_input(BenchmarkId::new("window_100", n), &scores, |b, s| {
            let engine = PValueEngine::new(Some(100), TieTolerance::default(), 1);
            b.iter(|| black_box(engine.p_values(s)))
        });
    }

    group.finish();
}

fn bench_martingales(c: &mut Criterion) {
    let mut group = c.benchmark_group("ville/martingale");
    let n = 10_000usize;
    let p: Vec<f64> = shifted_series(n).iter().map(|x| (x.abs() / 5.0).max(1e-3)).collect();
    group.throughput(Throughput::Elements(n as u64));

    group.bench_function("power_loop", |b| {
        b.iter(|| black_box(PowerMartingale::new(0.92).process(&p)))
    });
    group.bench_function("power_cumprod", |b| {
        b.iter(|| black_box(power_martingale_cumprod(&p, 0.92)))
    });
    group.bench_function("simple_jumper", |b| {
        b.iter(|| black_box(SimpleJumper::new(0.01).process(&p)))
    });

    let wealth = PowerMartingale::new(0.92).process(&p);
    let adaptive = ChangeDetector::new(ThresholdMode::default(), 0.05, 3);
    group.bench_function("detect_adaptive", |b| {
        b.iter(|| black_box(adaptive.detect(&wealth)))
    });

    group.finish();
}

// =============================================================================
// End to end
// =============================================================================

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("ville/pipeline");

    for n in [500usize, 2_000] {
        let series = shifted_series(n);
        group.throughput(Throughput::Elements(n as u64));
        let pipeline = Pipeline::new(PipelineConfig::default()).expect("default config");
        group.bench_with_input(BenchmarkId::new("univariate", n), &series, |b, s| {
            b.iter(|| black_box(pipeline.run(s).expect("finite series")))
        });
    }

    let data = table(500, 4);
    let pipeline = Pipeline::new(PipelineConfig::default().with_scorer(ScorerKind::Mahalanobis))
        .expect("mahalanobis config");
    group.bench_function("multivariate_500x4", |b| {
        b.iter(|| black_box(pipeline.run_multivariate(&data).expect("finite table")))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_scorers,
    bench_conformal_bag,
    bench_p_values,
    bench_martingales,
    bench_pipeline,
);
criterion_main!(benches);
