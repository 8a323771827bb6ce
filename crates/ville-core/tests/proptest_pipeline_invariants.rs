//! Property-based invariant tests for the detection pipeline.
//!
//! These tests verify structural invariants that must hold for any valid inputs:
//!
//! Scorers (1–3):
//! 1. Reference of 0 or 1 rows scores exactly 0 for every scorer.
//! 2. Scores are finite and non-negative.
//! 3. Mahalanobis stays finite on singular references (identical rows).
//!
//! P-values (4–6):
//! 4. Both p-values lie in (0, 1].
//! 5. With exact ties, randomized ≤ deterministic.
//! 6. Same seed → same p-values.
//!
//! Martingales (7–9):
//! 7. Wealth is finite and within [WEALTH_MIN, WEALTH_MAX] for any p-values.
//! 8. Power loop equals the log-space cumulative product, through clipping.
//! 9. Simple Jumper wealth equals the sum of its regime capital.
//!
//! Detection (10–13):
//! 10. min_consecutive = 1 reproduces the raw crossings exactly.
//! 11. Every maximal detection run has at least min_consecutive points.
//! 12. Every detection is a raw crossing.
//! 13. Non-finite wealth never crosses.
//!
//! Pipeline (14–15):
//! 14. Determinism: same config + series → same output.
//! 15. Streaming monitor reproduces the batch pipeline exactly.

use proptest::prelude::*;
use ville_core::martingale::JUMPER_DIRECTIONS;
use ville_core::{
    BettingMartingale, ChangeDetector, FeatureTable, NonconformityScorer, PValueEngine,
    Pipeline, PipelineConfig, PowerMartingale, ReferenceView, Scorer, ScorerKind, SimpleJumper,
    StreamingMonitor, ThresholdMode, TieTolerance, WEALTH_MAX, WEALTH_MIN,
    power_martingale_cumprod,
};

// ── Strategies ────────────────────────────────────────────────────────────

fn scorer_kind() -> impl Strategy<Value = ScorerKind> {
    prop::sample::select(ScorerKind::ALL.to_vec())
}

fn threshold_mode() -> impl Strategy<Value = ThresholdMode> {
    prop_oneof![
        Just(ThresholdMode::Fixed),
        (1usize..=40, 1.0f64..=10.0).prop_map(|(window, threshold_mult)| ThresholdMode::Adaptive {
            window,
            threshold_mult,
            statistic: Default::default(),
        }),
    ]
}

fn series(max_len: usize) -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(-1_000.0f64..=1_000.0, 0..=max_len)
}

fn p_values(max_len: usize) -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(
        prop_oneof![
            8 => 0.0f64..=1.0,
            1 => Just(0.0),
            1 => Just(1.0),
        ],
        1..=max_len,
    )
}

fn wealth_series(max_len: usize) -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::vec(
        prop_oneof![
            10 => 0.0f64..=100.0,
            1 => Just(f64::NAN),
            1 => Just(f64::INFINITY),
        ],
        0..=max_len,
    )
}

fn rows(max_rows: usize, max_dim: usize) -> impl Strategy<Value = (usize, Vec<f64>)> {
    (1usize..=max_dim).prop_flat_map(move |dim| {
        (
            Just(dim),
            proptest::collection::vec(-50.0f64..=50.0, 0..=max_rows * dim)
                .prop_map(move |mut v| {
                    v.truncate(v.len() - v.len() % dim);
                    v
                }),
        )
    })
}

// ═════════════════════════════════════════════════════════════════════════
// SCORERS
// ═════════════════════════════════════════════════════════════════════════

// ─── 1. Short reference scores zero ───────────────────────────────────

proptest! {
    #[test]
    fn short_reference_scores_zero(
        kind in scorer_kind(),
        current in proptest::collection::vec(-1e6f64..=1e6, 1..=4),
        keep_one in any::<bool>(),
    ) {
        let dim = current.len();
        let reference = if keep_one { vec![0.5; dim] } else { Vec::new() };
        let score = Scorer::from_kind(kind).score(&current, ReferenceView::new(&reference, dim));
        prop_assert_eq!(score, 0.0);
    }
}

// ─── 2. Scores finite and non-negative ────────────────────────────────

proptest! {
    #[test]
    fn scores_finite_non_negative(kind in scorer_kind(), (dim, data) in rows(30, 3)) {
        prop_assume!(!data.is_empty());
        let reference = ReferenceView::new(&data[dim..], dim);
        let score = Scorer::from_kind(kind).score(&data[..dim], reference);
        prop_assert!(score.is_finite() && score >= 0.0, "score = {}", score);
    }
}

// ─── 3. Mahalanobis on singular reference ─────────────────────────────

proptest! {
    #[test]
    fn mahalanobis_singular_reference_finite(
        point in proptest::collection::vec(-100.0f64..=100.0, 1..=4),
        copies in 2usize..=20,
        offset in -10.0f64..=10.0,
    ) {
        let dim = point.len();
        let reference: Vec<f64> = point.iter().copied().cycle().take(dim * copies).collect();
        let current: Vec<f64> = point.iter().map(|x| x + offset).collect();
        let score = Scorer::from_kind(ScorerKind::Mahalanobis)
            .score(&current, ReferenceView::new(&reference, dim));
        prop_assert!(score.is_finite() && score >= 0.0);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// P-VALUES
// ═════════════════════════════════════════════════════════════════════════

// ─── 4–5. Range and ordering ──────────────────────────────────────────

proptest! {
    #[test]
    fn p_values_in_unit_interval(
        scores in proptest::collection::vec(prop_oneof![0.0f64..=10.0, Just(1.0)], 1..=120),
        window in prop::option::of(1usize..=50),
        seed in any::<u64>(),
    ) {
        let p = PValueEngine::new(window, TieTolerance::EXACT, seed).p_values(&scores);
        prop_assert_eq!(p.len(), scores.len());
        for (d, r) in p.deterministic.iter().zip(&p.randomized) {
            prop_assert!(*d > 0.0 && *d <= 1.0);
            prop_assert!(*r > 0.0 && *r <= 1.0);
            prop_assert!(r <= d, "p_rnd {} > p_det {}", r, d);
        }
    }
}

// ─── 6. Seeded determinism ────────────────────────────────────────────

proptest! {
    #[test]
    fn p_values_deterministic_per_seed(scores in series(80), seed in any::<u64>()) {
        let engine = PValueEngine::new(None, TieTolerance::default(), seed);
        prop_assert_eq!(engine.p_values(&scores), engine.p_values(&scores));
    }
}

// ═════════════════════════════════════════════════════════════════════════
// MARTINGALES
// ═════════════════════════════════════════════════════════════════════════

// ─── 7. Wealth bounded ────────────────────────────────────────────────

proptest! {
    #[test]
    fn wealth_bounded(p in p_values(300), epsilon in 0.01f64..=0.99, jump in 0.0f64..=1.0) {
        let power = PowerMartingale::new(epsilon).process(&p);
        let jumper = SimpleJumper::new(jump).process(&p);
        for w in power.iter().chain(&jumper) {
            prop_assert!(w.is_finite());
            prop_assert!((WEALTH_MIN..=WEALTH_MAX * (1.0 + 1e-12)).contains(w), "w = {}", w);
        }
    }
}

// ─── 8. Loop equals cumulative product ────────────────────────────────

proptest! {
    #[test]
    fn power_loop_equals_cumprod(
        p in proptest::collection::vec(0.001f64..=1.0, 1..=200),
        epsilon in 0.05f64..=0.99,
    ) {
        let looped = PowerMartingale::new(epsilon).process(&p);
        let cumprod = power_martingale_cumprod(&p, epsilon);
        for (t, (a, b)) in looped.iter().zip(&cumprod).enumerate() {
            prop_assert!(
                (a - b).abs() <= 1e-9 * a.abs().max(*b),
                "index {}: {} vs {}",
                t,
                a,
                b
            );
        }
    }
}

// ─── 9. Jumper wealth is total capital ────────────────────────────────

proptest! {
    #[test]
    fn jumper_wealth_is_capital_sum(p in p_values(100), jump in 0.0f64..=1.0) {
        let mut m = SimpleJumper::new(jump);
        for &x in &p {
            let w = m.update(x);
            let sum: f64 = m.capital().iter().sum();
            prop_assert!((w - sum).abs() <= 1e-9 * w.max(1.0));
            prop_assert!(m.capital().iter().all(|c| *c >= 0.0));
        }
        prop_assert_eq!(JUMPER_DIRECTIONS.len(), m.capital().len());
    }
}

// ═════════════════════════════════════════════════════════════════════════
// DETECTION
// ═════════════════════════════════════════════════════════════════════════

// ─── 10. k = 1 equals raw crossings ───────────────────────────────────

proptest! {
    #[test]
    fn k_one_recovers_raw_crossings(m in wealth_series(200), mode in threshold_mode()) {
        let report = ChangeDetector::new(mode, 0.05, 1).detect(&m);
        prop_assert_eq!(&report.detections, &report.diagnostics.crossings);
    }
}

// ─── 11–13. Run lengths, subset of crossings, non-finite ──────────────

proptest! {
    #[test]
    fn confirmed_runs_respect_min_consecutive(
        m in wealth_series(200),
        mode in threshold_mode(),
        k in 1usize..=6,
    ) {
        let report = ChangeDetector::new(mode, 0.05, k).detect(&m);
        let mut run = 0usize;
        for (i, &d) in report.detections.iter().enumerate() {
            if d {
                prop_assert!(
                    report.diagnostics.crossings[i],
                    "detection at {} without crossing",
                    i
                );
                run += 1;
            } else {
                prop_assert!(run == 0 || run >= k, "run of {} < {}", run, k);
                run = 0;
            }
            if !m[i].is_finite() {
                prop_assert!(!report.diagnostics.crossings[i]);
            }
        }
        prop_assert!(run == 0 || run >= k);
        for r in &report.diagnostics.confirmed_runs {
            prop_assert!(r.len() >= k);
        }
        let non_finite = m.iter().filter(|v| !v.is_finite()).count();
        prop_assert_eq!(report.diagnostics.non_finite, non_finite);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═════════════════════════════════════════════════════════════════════════

// ─── 14. Determinism ──────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn pipeline_deterministic(xs in series(60), kind in scorer_kind(), seed in any::<u64>()) {
        let config = PipelineConfig::default().with_scorer(kind).with_seed(seed);
        let pipeline = Pipeline::new(config).unwrap();
        let a = pipeline.run(&xs).unwrap();
        let b = pipeline.run(&xs).unwrap();
        prop_assert_eq!(a, b);
    }
}

// ─── 15. Streaming equals batch ───────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn streaming_equals_batch(
        (dim, data) in rows(40, 3),
        kind in scorer_kind(),
        reference_window in prop::option::of(2usize..=15),
        pvalue_window in prop::option::of(2usize..=15),
        mode in threshold_mode(),
        seed in any::<u64>(),
    ) {
        prop_assume!(!data.is_empty());
        let config = PipelineConfig::default()
            .with_scorer(kind)
            .with_reference_window(reference_window)
            .with_pvalue_window(pvalue_window)
            .with_threshold(mode)
            .with_seed(seed);
        let row_vecs: Vec<Vec<f64>> = data.chunks_exact(dim).map(<[f64]>::to_vec).collect();
        let table = FeatureTable::from_rows(&row_vecs).unwrap();
        let batch = Pipeline::new(config.clone()).unwrap().run_table(&table);

        let mut monitor = StreamingMonitor::new(config, dim).unwrap();
        let mut p_det = Vec::new();
        let mut p_rnd = Vec::new();
        for row in &row_vecs {
            let step = monitor.observe(row).unwrap();
            p_det.push(step.p_det);
            p_rnd.push(step.p_rnd);
        }
        prop_assert_eq!(monitor.scores(), batch.scores.as_slice());
        prop_assert_eq!(p_det, batch.p_det);
        prop_assert_eq!(p_rnd, batch.p_rnd);
        prop_assert_eq!(monitor.wealth(), batch.martingale.as_slice());
        prop_assert_eq!(monitor.detections(), batch.detections.as_slice());
    }
}
