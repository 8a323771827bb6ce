#![forbid(unsafe_code)]

//! Nonconformity scoring.
//!
//! A scorer turns a new observation plus a reference set into one
//! non-negative "strangeness" value. Higher means further from the bulk of
//! the reference.
//!
//! # Scorers
//!
//! For an observation `x ∈ ℝᵈ` and reference rows `r_1..r_n`:
//!
//! ```text
//! mean_dev         sqrt( mean_j ( |x_j − μ_j| / (σ_j + ε) )² )
//! robust_mean_dev  sqrt( mean_j ( |x_j − med_j| / (1.4826·MAD_j + ε) )² )
//! min_dist         min_i  ‖x − r_i‖ / √d
//! mean_dist        mean_i ‖x − r_i‖ / √d
//! mahalanobis      sqrt( (x − μ)ᵀ (Σ + λI)⁻¹ (x − μ) )
//! ```
//!
//! With `d = 1` each formula is exactly its scalar form, e.g.
//! `|x − mean| / (std + ε)`.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `n < 2` | score `0.0` (no evidence yet) |
//! | `σ = 0` or `MAD = 0` | `ε` keeps the denominator positive |
//! | singular `Σ` | ridge `λI`, escalated tenfold if factorization fails |
//! | non-finite result | score `0.0` |
//!
//! Scoring is deterministic: identical inputs give identical scores.

use tracing::trace;

use crate::config::ScorerKind;
use crate::stats::{self, MAD_SCALE};
use crate::table::{FeatureTable, ReferenceView};

/// Denominator guard for deviation scorers.
pub const SCORE_EPSILON: f64 = 1e-8;

/// Default ridge added to the covariance diagonal.
pub const DEFAULT_RIDGE: f64 = 1e-6;

/// Maximum tenfold ridge escalations before giving up on a factorization.
const MAX_RIDGE_ESCALATIONS: usize = 8;

/// Minimum reference size that yields a non-zero score.
pub const MIN_REFERENCE: usize = 2;

/// Strategy contract for nonconformity scores.
pub trait NonconformityScorer {
    /// Score `current` against `reference`. Always finite and `≥ 0`.
    ///
    /// `current.len()` must equal `reference.cols()`. Debug builds assert
    /// it; release builds may panic on an out-of-range column or read the
    /// wrong features.
    fn score(&self, current: &[f64], reference: ReferenceView<'_>) -> f64;

    fn kind(&self) -> ScorerKind;
}

#[inline]
fn debug_check_width(current: &[f64], reference: ReferenceView<'_>) {
    debug_assert_eq!(
        current.len(),
        reference.cols(),
        "observation width must match the reference"
    );
}

// ─── Deviation scorers ───────────────────────────────────────────────────

/// Standardized distance from the reference mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanDeviation;

impl NonconformityScorer for MeanDeviation {
    fn score(&self, current: &[f64], reference: ReferenceView<'_>) -> f64 {
        debug_check_width(current, reference);
        if reference.len() < MIN_REFERENCE {
            return 0.0;
        }
        rms_standardized(current, reference, |column| {
            (stats::mean(column), stats::std_dev(column))
        })
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::MeanDev
    }
}

/// Median/MAD variant of [`MeanDeviation`], resistant to outliers in the
/// reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct RobustMeanDeviation;

impl NonconformityScorer for RobustMeanDeviation {
    fn score(&self, current: &[f64], reference: ReferenceView<'_>) -> f64 {
        debug_check_width(current, reference);
        if reference.len() < MIN_REFERENCE {
            return 0.0;
        }
        rms_standardized(current, reference, |column| {
            (stats::median(column), MAD_SCALE * stats::mad(column))
        })
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::RobustMeanDev
    }
}

/// Root-mean-square of per-feature standardized deviations. `center_scale`
/// returns `(center, spread)` for one reference column.
fn rms_standardized<F>(current: &[f64], reference: ReferenceView<'_>, center_scale: F) -> f64
where
    F: Fn(&[f64]) -> (f64, f64),
{
    let d = current.len();
    let mut sum_sq = 0.0;
    for (j, &x) in current.iter().enumerate() {
        let column = reference.column(j);
        let (center, spread) = center_scale(&column);
        let z = (x - center).abs() / (spread + SCORE_EPSILON);
        sum_sq += z * z;
    }
    finite_or_zero((sum_sq / d as f64).sqrt())
}

// ─── Distance scorers ────────────────────────────────────────────────────

/// How per-row distances are reduced to one score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceAggregate {
    Min,
    Mean,
}

/// Normalized Euclidean distance to each reference row, reduced by min or
/// mean. Min captures local density (distance to the nearest neighbour);
/// mean captures distance from the reference cloud as a whole.
#[derive(Debug, Clone, Copy)]
pub struct PairwiseDistance {
    pub aggregate: DistanceAggregate,
}

impl PairwiseDistance {
    pub fn min() -> Self {
        Self {
            aggregate: DistanceAggregate::Min,
        }
    }

    pub fn mean() -> Self {
        Self {
            aggregate: DistanceAggregate::Mean,
        }
    }
}

/// `‖a − b‖ / √d`.
#[inline]
pub fn normalized_euclidean(a: &[f64], b: &[f64]) -> f64 {
    let ss: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    (ss / a.len() as f64).sqrt()
}

impl NonconformityScorer for PairwiseDistance {
    fn score(&self, current: &[f64], reference: ReferenceView<'_>) -> f64 {
        debug_check_width(current, reference);
        if reference.len() < MIN_REFERENCE {
            return 0.0;
        }
        let distances = reference
            .iter_rows()
            .map(|row| normalized_euclidean(current, row));
        let score = match self.aggregate {
            DistanceAggregate::Min => distances.fold(f64::INFINITY, f64::min),
            DistanceAggregate::Mean => distances.sum::<f64>() / reference.len() as f64,
        };
        finite_or_zero(score)
    }

    fn kind(&self) -> ScorerKind {
        match self.aggregate {
            DistanceAggregate::Min => ScorerKind::MinDist,
            DistanceAggregate::Mean => ScorerKind::MeanDist,
        }
    }
}

// ─── Mahalanobis ─────────────────────────────────────────────────────────

/// Mahalanobis distance with a ridge on the covariance diagonal, so small
/// or collinear references stay invertible.
#[derive(Debug, Clone, Copy)]
pub struct Mahalanobis {
    pub ridge: f64,
}

impl Default for Mahalanobis {
    fn default() -> Self {
        Self {
            ridge: DEFAULT_RIDGE,
        }
    }
}

impl NonconformityScorer for Mahalanobis {
    fn score(&self, current: &[f64], reference: ReferenceView<'_>) -> f64 {
        debug_check_width(current, reference);
        if reference.len() < MIN_REFERENCE {
            return 0.0;
        }
        let d = current.len();
        let n = reference.len() as f64;

        let mut mu = vec![0.0; d];
        for row in reference.iter_rows() {
            for (m, v) in mu.iter_mut().zip(row) {
                *m += v;
            }
        }
        for m in &mut mu {
            *m /= n;
        }

        // Population covariance, row-major d×d.
        let mut cov = vec![0.0; d * d];
        for row in reference.iter_rows() {
            for i in 0..d {
                let di = row[i] - mu[i];
                for j in 0..=i {
                    cov[i * d + j] += di * (row[j] - mu[j]);
                }
            }
        }
        for i in 0..d {
            for j in 0..=i {
                cov[i * d + j] /= n;
                cov[j * d + i] = cov[i * d + j];
            }
        }

        let diff: Vec<f64> = current.iter().zip(&mu).map(|(x, m)| x - m).collect();

        let mut ridge = self.ridge.max(f64::MIN_POSITIVE);
        for attempt in 0..=MAX_RIDGE_ESCALATIONS {
            let mut factor = cov.clone();
            for i in 0..d {
                factor[i * d + i] += ridge;
            }
            if cholesky_in_place(&mut factor, d) {
                let q = forward_substitute_norm_sq(&factor, &diff, d);
                return finite_or_zero(q.max(0.0).sqrt());
            }
            trace!(attempt, ridge, "covariance not positive definite, escalating ridge");
            ridge *= 10.0;
        }
        0.0
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::Mahalanobis
    }
}

/// Lower Cholesky factor of a symmetric row-major matrix, in place.
/// Returns `false` if a pivot is not strictly positive.
fn cholesky_in_place(a: &mut [f64], d: usize) -> bool {
    for j in 0..d {
        let mut pivot = a[j * d + j];
        for k in 0..j {
            pivot -= a[j * d + k] * a[j * d + k];
        }
        if !(pivot > 0.0 && pivot.is_finite()) {
            return false;
        }
        let l = pivot.sqrt();
        a[j * d + j] = l;
        for i in (j + 1)..d {
            let mut s = a[i * d + j];
            for k in 0..j {
                s -= a[i * d + k] * a[j * d + k];
            }
            a[i * d + j] = s / l;
        }
    }
    true
}

/// `‖L⁻¹ v‖²`, which equals `vᵀ (L Lᵀ)⁻¹ v`.
fn forward_substitute_norm_sq(l: &[f64], v: &[f64], d: usize) -> f64 {
    let mut y = vec![0.0; d];
    for i in 0..d {
        let mut s = v[i];
        for k in 0..i {
            s -= l[i * d + k] * y[k];
        }
        y[i] = s / l[i * d + i];
    }
    y.iter().map(|v| v * v).sum()
}

#[inline]
pub(crate) fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}

// ─── Dispatch ────────────────────────────────────────────────────────────

/// Scorer resolved from a [`ScorerKind`].
#[derive(Debug, Clone, Copy)]
pub enum Scorer {
    MeanDev(MeanDeviation),
    RobustMeanDev(RobustMeanDeviation),
    Distance(PairwiseDistance),
    Mahalanobis(Mahalanobis),
}

impl Scorer {
    pub fn from_kind(kind: ScorerKind) -> Self {
        match kind {
            ScorerKind::MeanDev => Self::MeanDev(MeanDeviation),
            ScorerKind::RobustMeanDev => Self::RobustMeanDev(RobustMeanDeviation),
            ScorerKind::MinDist => Self::Distance(PairwiseDistance::min()),
            ScorerKind::MeanDist => Self::Distance(PairwiseDistance::mean()),
            ScorerKind::Mahalanobis => Self::Mahalanobis(Mahalanobis::default()),
        }
    }
}

impl NonconformityScorer for Scorer {
    #[inline]
    fn score(&self, current: &[f64], reference: ReferenceView<'_>) -> f64 {
        match self {
            Self::MeanDev(s) => s.score(current, reference),
            Self::RobustMeanDev(s) => s.score(current, reference),
            Self::Distance(s) => s.score(current, reference),
            Self::Mahalanobis(s) => s.score(current, reference),
        }
    }

    fn kind(&self) -> ScorerKind {
        match self {
            Self::MeanDev(s) => s.kind(),
            Self::RobustMeanDev(s) => s.kind(),
            Self::Distance(s) => s.kind(),
            Self::Mahalanobis(s) => s.kind(),
        }
    }
}

/// Start of the trailing reference for row `t`.
#[inline]
pub fn reference_start(t: usize, window: Option<usize>) -> usize {
    window.map_or(0, |w| t.saturating_sub(w))
}

/// Score every row of `table` against its trailing reference: all prior
/// rows, or the last `window` of them.
///
/// Each index reads only earlier rows and writes only its own slot, so
/// with the `parallel` feature the loop runs on the rayon pool with
/// identical output.
pub fn score_series<S>(scorer: &S, table: &FeatureTable, window: Option<usize>) -> Vec<f64>
where
    S: NonconformityScorer + Sync,
{
    let score_at = |t: usize| {
        let start = reference_start(t, window);
        scorer.score(table.row(t), table.view(start..t))
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        (0..table.rows()).into_par_iter().map(score_at).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        (0..table.rows()).map(score_at).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(values: &[f64]) -> ReferenceView<'_> {
        ReferenceView::scalar(values)
    }

    // ─── Warm-up ─────────────────────────────────────────────────────

    #[test]
    fn short_reference_scores_zero_for_every_kind() {
        for kind in ScorerKind::ALL {
            let scorer = Scorer::from_kind(kind);
            assert_eq!(scorer.score(&[42.0], scalar(&[])), 0.0, "{kind} empty");
            assert_eq!(scorer.score(&[42.0], scalar(&[1.0])), 0.0, "{kind} single");
            assert_eq!(scorer.kind(), kind);
        }
    }

    // ─── Deviation scorers ───────────────────────────────────────────

    #[test]
    fn mean_dev_matches_scalar_formula() {
        let reference = [1.0, 2.0, 3.0, 4.0, 5.0];
        let m = 3.0;
        let s = 2.0f64.sqrt(); // population std of 1..=5
        let expected = (9.0 - m) / (s + SCORE_EPSILON);
        let got = MeanDeviation.score(&[9.0], scalar(&reference));
        assert!((got - expected).abs() < 1e-12, "{got} vs {expected}");
    }

    #[test]
    fn mean_dev_is_monotone_in_distance() {
        let reference = [0.0, 1.0, -1.0, 0.5, -0.5];
        let near = MeanDeviation.score(&[0.2], scalar(&reference));
        let far = MeanDeviation.score(&[3.0], scalar(&reference));
        let farther = MeanDeviation.score(&[-6.0], scalar(&reference));
        assert!(near < far && far < farther);
    }

    #[test]
    fn zero_variance_reference_is_finite() {
        let reference = [7.0; 10];
        let same = MeanDeviation.score(&[7.0], scalar(&reference));
        assert_eq!(same, 0.0);
        let other = MeanDeviation.score(&[8.0], scalar(&reference));
        assert!(other.is_finite() && other > 1e6);
        let robust = RobustMeanDeviation.score(&[8.0], scalar(&reference));
        assert!(robust.is_finite() && robust > 1e6);
    }

    #[test]
    fn robust_ignores_reference_outlier() {
        let clean = [0.0, 1.0, -1.0, 0.5, -0.5, 0.2, -0.2];
        let mut dirty = clean.to_vec();
        dirty.push(1e6);
        let plain_clean = MeanDeviation.score(&[3.0], scalar(&clean));
        let plain_dirty = MeanDeviation.score(&[3.0], scalar(&dirty));
        let robust_clean = RobustMeanDeviation.score(&[3.0], scalar(&clean));
        let robust_dirty = RobustMeanDeviation.score(&[3.0], scalar(&dirty));
        // The outlier inflates the std and hides the anomaly from mean_dev...
        assert!(plain_clean > 4.0);
        assert!(plain_dirty < 1.0);
        // ...but barely moves the median/MAD score.
        assert!(robust_dirty > robust_clean / 2.0);
    }

    #[test]
    fn vector_mean_dev_is_rms_of_features() {
        let rows = [1.0, 10.0, 3.0, 30.0]; // two rows, two features
        let reference = ReferenceView::new(&rows, 2);
        // Feature 0: mean 2, std 1. Feature 1: mean 20, std 10.
        let z0 = 2.0 / (1.0 + SCORE_EPSILON);
        let z1 = 0.0;
        let expected = ((z0 * z0 + z1 * z1) / 2.0f64).sqrt();
        let got = MeanDeviation.score(&[4.0, 20.0], reference);
        assert!((got - expected).abs() < 1e-12);
    }

    // ─── Distance scorers ────────────────────────────────────────────

    #[test]
    fn min_and_mean_distance_scalar() {
        let reference = [0.0, 4.0, 10.0];
        let min = PairwiseDistance::min().score(&[3.0], scalar(&reference));
        let mean = PairwiseDistance::mean().score(&[3.0], scalar(&reference));
        assert_eq!(min, 1.0);
        assert!((mean - (3.0 + 1.0 + 7.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn euclidean_normalized_by_dimension() {
        let a = [0.0, 0.0, 0.0, 0.0];
        let b = [2.0, 2.0, 2.0, 2.0];
        // ‖a − b‖ = 4, √d = 2.
        assert!((normalized_euclidean(&a, &b) - 2.0).abs() < 1e-12);
    }

    // ─── Mahalanobis ─────────────────────────────────────────────────

    #[test]
    fn mahalanobis_singular_reference_is_finite() {
        let rows = [1.0, 2.0, 3.0].repeat(5); // five identical 3-vectors
        let reference = ReferenceView::new(&rows, 3);
        let at_mean = Mahalanobis::default().score(&[1.0, 2.0, 3.0], reference);
        assert_eq!(at_mean, 0.0);
        let off = Mahalanobis::default().score(&[2.0, 2.0, 3.0], reference);
        assert!(off.is_finite() && off > 0.0);
    }

    #[test]
    fn mahalanobis_collinear_reference_is_finite() {
        // Second feature is exactly twice the first: rank-1 covariance.
        let rows: Vec<f64> = (0..20).flat_map(|i| [i as f64, 2.0 * i as f64]).collect();
        let reference = ReferenceView::new(&rows, 2);
        let on_line = Mahalanobis::default().score(&[5.0, 10.0], reference);
        let off_line = Mahalanobis::default().score(&[5.0, -10.0], reference);
        assert!(on_line.is_finite() && off_line.is_finite());
        assert!(off_line > on_line);
    }

    #[test]
    fn mahalanobis_one_dimension_matches_z_score() {
        let reference = [1.0, 2.0, 3.0, 4.0, 5.0];
        let var = 2.0; // population variance
        let got = Mahalanobis::default().score(&[7.0], scalar(&reference));
        let expected = 4.0 / (var + DEFAULT_RIDGE).sqrt();
        assert!((got - expected).abs() < 1e-9);
    }

    #[test]
    fn mahalanobis_accounts_for_correlation() {
        // Strong positive correlation: moving along the diagonal is normal,
        // moving against it is anomalous.
        let rows: Vec<f64> = (0..50)
            .flat_map(|i| {
                let x = (i as f64 * 0.37).sin() * 3.0;
                [x, x + 0.1 * (i as f64 * 1.3).cos()]
            })
            .collect();
        let reference = ReferenceView::new(&rows, 2);
        let along = Mahalanobis::default().score(&[2.0, 2.0], reference);
        let against = Mahalanobis::default().score(&[2.0, -2.0], reference);
        assert!(against > 5.0 * along, "along={along} against={against}");
    }

    // ─── Series scoring ──────────────────────────────────────────────

    #[test]
    fn score_series_uses_trailing_reference() {
        let table = FeatureTable::univariate(&[0.0, 1.0, 0.0, 1.0, 100.0]).unwrap();
        let scores = score_series(&MeanDeviation, &table, None);
        assert_eq!(scores.len(), 5);
        assert_eq!(scores[0], 0.0);
        assert_eq!(scores[1], 0.0);
        assert!(scores[4] > scores[3]);

        let windowed = score_series(&MeanDeviation, &table, Some(2));
        let expected = MeanDeviation.score(&[100.0], scalar(&[0.0, 1.0]));
        assert_eq!(windowed[4], expected);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "observation width must match the reference")]
    fn width_mismatch_asserts_in_debug() {
        let rows = [1.0, 10.0, 3.0, 30.0, 5.0, 50.0];
        MeanDeviation.score(&[4.0], ReferenceView::new(&rows, 2));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "observation width must match the reference")]
    fn wide_observation_asserts_for_mahalanobis() {
        let rows = [1.0, 2.0, 3.0, 4.0];
        Mahalanobis::default().score(&[1.0, 2.0, 3.0], ReferenceView::new(&rows, 2));
    }

    #[test]
    fn reference_start_respects_window() {
        assert_eq!(reference_start(10, None), 0);
        assert_eq!(reference_start(10, Some(3)), 7);
        assert_eq!(reference_start(2, Some(5)), 0);
    }
}
