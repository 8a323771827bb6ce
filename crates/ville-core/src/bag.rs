#![forbid(unsafe_code)]

//! Leave-one-out calibration over a bag of observations.
//!
//! # Mathematical Model
//!
//! At index `n` the bag `B` holds the trailing observations up to and
//! including `x_n`, at most [`PipelineConfig::bag_capacity`] of them. Every
//! member is scored against the rest of the bag, and the current point is
//! ranked among those scores:
//!
//! ```text
//! α_i      = A(x_i, B \ {x_i})          for every i ∈ B
//! p_det[n] = |{ i ∈ B : α_i ≥ α_n }| / |B|
//! p_rnd[n] = (G + u·E) / |B|
//! ```
//!
//! `G` and `E` are counted exactly as in [`conformal_p_value`], and `α_n` is
//! the scorer's ordinary score of `x_n` against its reference. Every `α_i` is
//! the same symmetric function of the bag, so exchangeable data gives
//! exchangeable member scores and an exactly Uniform(0, 1) `p_rnd`, however
//! strongly the score depends on the reference size.
//!
//! | Rule | Cost per observation |
//! |------|----------------------|
//! | `min_dist`, `mean_dist` | `O(|B|·d)`, neighbour distances kept incrementally |
//! | `robust_mean_dev` | `O(d·|B|)`, leave-one-out medians from three middle order statistics |
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `|B| < 3` | score `0.0`, both p-values `1.0` |
//! | evicted member was someone's nearest neighbour | that nearest distance is recomputed |
//! | zero MAD | `ε` keeps the denominator positive, as in the scorer |
//!
//! [`PipelineConfig::bag_capacity`]: crate::config::PipelineConfig::bag_capacity

use crate::config::{ScorerKind, TieTolerance};
use crate::pvalue::{ConformalPValues, PValuePair, TieBreaker, conformal_p_value};
use crate::scorer::{
    DistanceAggregate, MIN_REFERENCE, SCORE_EPSILON, finite_or_zero, normalized_euclidean,
};
use crate::stats::MAD_SCALE;
use crate::table::FeatureTable;

/// Leave-one-out score applied inside the bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagRule {
    /// Nearest or mean normalized distance to the other members.
    Distance(DistanceAggregate),
    /// Median/MAD deviation from the other members.
    Robust,
}

impl BagRule {
    /// Rule for `kind`, or `None` when the scorer ranks against its score
    /// history instead.
    pub fn for_scorer(kind: ScorerKind) -> Option<Self> {
        match kind {
            ScorerKind::MinDist => Some(Self::Distance(DistanceAggregate::Min)),
            ScorerKind::MeanDist => Some(Self::Distance(DistanceAggregate::Mean)),
            ScorerKind::RobustMeanDev => Some(Self::Robust),
            ScorerKind::MeanDev | ScorerKind::Mahalanobis => None,
        }
    }
}

/// Sliding or growing bag of observations with their leave-one-out scores.
#[derive(Debug, Clone)]
pub struct ConformalBag {
    rule: BagRule,
    dim: usize,
    capacity: Option<usize>,
    /// Members, row-major, oldest first.
    data: Vec<f64>,
    /// Distance rules: per member, nearest distance to another member.
    nearest: Vec<f64>,
    /// Distance rules: per member, summed distance to the other members.
    total: Vec<f64>,
    /// Leave-one-out scores after the last push. Empty during warm-up.
    alphas: Vec<f64>,
}

impl ConformalBag {
    /// Empty bag of `dim`-wide rows holding at most `capacity` members
    /// (`None` grows without bound).
    pub fn new(rule: BagRule, dim: usize, capacity: Option<usize>) -> Self {
        Self {
            rule,
            dim: dim.max(1),
            capacity: capacity.map(|c| c.max(1)),
            data: Vec::new(),
            nearest: Vec::new(),
            total: Vec::new(),
            alphas: Vec::new(),
        }
    }

    /// Bag for `kind`, or `None` when that scorer is calibrated on its score
    /// history.
    pub fn for_scorer(kind: ScorerKind, dim: usize, capacity: Option<usize>) -> Option<Self> {
        BagRule::for_scorer(kind).map(|rule| Self::new(rule, dim, capacity))
    }

    pub fn rule(&self) -> BagRule {
        self.rule
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Leave-one-out scores of every member, oldest first, newest last.
    pub fn scores(&self) -> &[f64] {
        &self.alphas
    }

    /// Admit `row` as the newest member, evicting the oldest past capacity,
    /// and return its score against the rest of the bag.
    pub fn push(&mut self, row: &[f64]) -> f64 {
        debug_assert_eq!(row.len(), self.dim, "row width must match the bag");
        if let Some(capacity) = self.capacity {
            while self.len() >= capacity {
                self.evict_oldest();
            }
        }
        if matches!(self.rule, BagRule::Distance(_)) {
            self.link(row);
        }
        self.data.extend_from_slice(row);
        self.rescore();
        self.alphas.last().copied().unwrap_or(0.0)
    }

    /// P-values of the newest member with tie-breaking draw `u`.
    pub fn p_values(&self, u: f64, tolerance: TieTolerance) -> PValuePair {
        match self.alphas.last() {
            Some(&current) => conformal_p_value(&self.alphas, current, u, tolerance),
            None => PValuePair::NO_EVIDENCE,
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.nearest.clear();
        self.total.clear();
        self.alphas.clear();
    }

    /// Scores and p-values for every row of `table`, drawing one tie-breaker
    /// uniform per row.
    pub fn series(
        mut self,
        table: &FeatureTable,
        tolerance: TieTolerance,
        seed: u64,
    ) -> (Vec<f64>, ConformalPValues) {
        let mut breaker = TieBreaker::new(seed);
        let mut scores = Vec::with_capacity(table.rows());
        let mut p = ConformalPValues {
            deterministic: Vec::with_capacity(table.rows()),
            randomized: Vec::with_capacity(table.rows()),
        };
        for t in 0..table.rows() {
            scores.push(self.push(table.row(t)));
            let pair = self.p_values(breaker.next_uniform(), tolerance);
            p.deterministic.push(pair.deterministic);
            p.randomized.push(pair.randomized);
        }
        (scores, p)
    }

    #[inline]
    fn member(&self, i: usize) -> &[f64] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    // ─── Distance bookkeeping ────────────────────────────────────────

    /// Distance from `row` to every current member, oldest first.
    fn distances_to(&self, row: &[f64]) -> Vec<f64> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.data
                .par_chunks_exact(self.dim)
                .map(|member| normalized_euclidean(row, member))
                .collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            self.data
                .chunks_exact(self.dim)
                .map(|member| normalized_euclidean(row, member))
                .collect()
        }
    }

    /// Fold the distances between `row` and the members into both sides'
    /// nearest and summed distances.
    fn link(&mut self, row: &[f64]) {
        let distances = self.distances_to(row);
        for ((nearest, total), &d) in self.nearest.iter_mut().zip(&mut self.total).zip(&distances) {
            *nearest = nearest.min(d);
            *total += d;
        }
        self.nearest.push(distances.iter().copied().fold(f64::INFINITY, f64::min));
        self.total.push(distances.iter().sum());
    }

    fn evict_oldest(&mut self) {
        let gone: Vec<f64> = self.data.drain(..self.dim).collect();
        if !matches!(self.rule, BagRule::Distance(_)) {
            return;
        }
        self.nearest.remove(0);
        self.total.remove(0);
        for i in 0..self.nearest.len() {
            let d = normalized_euclidean(self.member(i), &gone);
            self.total[i] -= d;
            if d <= self.nearest[i] {
                self.nearest[i] = self.nearest_excluding(i);
            }
        }
    }

    fn nearest_excluding(&self, i: usize) -> f64 {
        let own = self.member(i);
        self.data
            .chunks_exact(self.dim)
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, other)| normalized_euclidean(own, other))
            .fold(f64::INFINITY, f64::min)
    }

    // ─── Scoring ─────────────────────────────────────────────────────

    fn rescore(&mut self) {
        self.alphas.clear();
        let n = self.len();
        if n <= MIN_REFERENCE {
            return;
        }
        match self.rule {
            BagRule::Distance(DistanceAggregate::Min) => {
                self.alphas.extend(self.nearest.iter().map(|&d| finite_or_zero(d)));
            }
            BagRule::Distance(DistanceAggregate::Mean) => {
                let others = (n - 1) as f64;
                self.alphas
                    .extend(self.total.iter().map(|&s| finite_or_zero(s.max(0.0) / others)));
            }
            BagRule::Robust => self.rescore_robust(n),
        }
    }

    /// Robust scores of all `n` members. Removing one value moves a median
    /// to one of at most three candidates, so each column needs the middle of
    /// its values and the middle of its deviations from each candidate.
    fn rescore_robust(&mut self, n: usize) {
        let mut sum_sq = vec![0.0; n];
        for j in 0..self.dim {
            let column: Vec<f64> = self.data.iter().skip(j).step_by(self.dim).copied().collect();
            let middle = Middle::of(column.clone());

            let mut spreads: Vec<(f64, Middle)> = Vec::with_capacity(3);
            for (i, &x) in column.iter().enumerate() {
                let center = middle.median_without(x);
                let k = match spreads.iter().position(|(c, _)| c.to_bits() == center.to_bits()) {
                    Some(k) => k,
                    None => {
                        let deviations = column.iter().map(|v| (v - center).abs()).collect();
                        spreads.push((center, Middle::of(deviations)));
                        spreads.len() - 1
                    }
                };
                let own = (x - center).abs();
                let mad = spreads[k].1.median_without(own);
                let z = own / (MAD_SCALE * mad + SCORE_EPSILON);
                sum_sq[i] += z * z;
            }
        }
        let d = self.dim as f64;
        self.alphas
            .extend(sum_sq.into_iter().map(|s| finite_or_zero((s / d).sqrt())));
    }
}

/// Middle order statistics of a sample of at least three values: enough to
/// take its median, interpolated the way [`stats::median`] does, after
/// removing any one value.
///
/// [`stats::median`]: crate::stats::median
#[derive(Debug, Clone, Copy)]
struct Middle {
    lo: usize,
    hi: usize,
    frac: f64,
    /// Order statistics `lo`, `lo + 1` and `lo + 2` in total order.
    stats: [f64; 3],
}

impl Middle {
    fn of(mut values: Vec<f64>) -> Self {
        let remaining = values.len() - 1;
        let rank = 0.5 * (remaining - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;

        let (_, nth, above) = values.select_nth_unstable_by(lo, f64::total_cmp);
        let mut next = [f64::INFINITY; 2];
        for &v in above.iter() {
            if v.total_cmp(&next[0]).is_lt() {
                next = [v, next[0]];
            } else if v.total_cmp(&next[1]).is_lt() {
                next[1] = v;
            }
        }
        Self {
            lo,
            hi,
            frac: rank - lo as f64,
            stats: [*nth, next[0], next[1]],
        }
    }

    /// Median of the sample with one occurrence of `x` removed.
    fn median_without(&self, x: f64) -> f64 {
        // Order statistic j of the reduced sample.
        let at = |j: usize| {
            let k = j - self.lo;
            if self.stats[k].total_cmp(&x).is_lt() {
                self.stats[k]
            } else {
                self.stats[k + 1]
            }
        };
        let (a, b) = (at(self.lo), at(self.hi));
        a + (b - a) * self.frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Calibration;
    use crate::scorer::{NonconformityScorer, Scorer};
    use crate::stats;
    use crate::table::ReferenceView;

    fn noise(i: usize) -> f64 {
        let x = (i as f64 * 12.9898).sin() * 43_758.545_3;
        2.0 * (x - x.floor()) - 1.0
    }

    fn rows(n: usize, dim: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| (0..dim).map(|j| noise(i * 7 + j * 1_000)).collect())
            .collect()
    }

    /// Every member scored against all the others, from scratch.
    fn naive_scores(kind: ScorerKind, members: &[Vec<f64>]) -> Vec<f64> {
        let scorer = Scorer::from_kind(kind);
        let dim = members[0].len();
        (0..members.len())
            .map(|i| {
                let others: Vec<f64> = members
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .flat_map(|(_, row)| row.iter().copied())
                    .collect();
                scorer.score(&members[i], ReferenceView::new(&others, dim))
            })
            .collect()
    }

    const BAG_KINDS: [ScorerKind; 3] =
        [ScorerKind::MinDist, ScorerKind::MeanDist, ScorerKind::RobustMeanDev];

    #[test]
    fn rule_follows_scorer_calibration() {
        for kind in ScorerKind::ALL {
            let bagged = BagRule::for_scorer(kind).is_some();
            assert_eq!(bagged, kind.calibration() == Calibration::LeaveOneOut, "{kind}");
        }
    }

    #[test]
    fn warm_up_has_no_evidence() {
        let mut bag = ConformalBag::new(BagRule::Robust, 1, None);
        for x in [3.0, 4.0] {
            assert_eq!(bag.push(&[x]), 0.0);
            assert_eq!(bag.p_values(0.5, TieTolerance::EXACT), PValuePair::NO_EVIDENCE);
            assert!(bag.scores().is_empty());
        }
        assert!(bag.push(&[5.0]) > 0.0);
        assert_eq!(bag.scores().len(), 3);
    }

    #[test]
    fn current_score_equals_scorer_against_rest() {
        let data = rows(40, 2);
        for kind in BAG_KINDS {
            let scorer = Scorer::from_kind(kind);
            for capacity in [None, Some(12)] {
                let mut bag = ConformalBag::for_scorer(kind, 2, capacity).unwrap();
                for (t, row) in data.iter().enumerate() {
                    let score = bag.push(row);
                    let start = capacity.map_or(0, |c| (t + 1).saturating_sub(c));
                    let reference: Vec<f64> = data[start..t].concat();
                    let expected = scorer.score(row, ReferenceView::new(&reference, 2));
                    assert_eq!(score, expected, "{kind} capacity {capacity:?} t {t}");
                }
            }
        }
    }

    #[test]
    fn member_scores_match_full_recompute() {
        let data = rows(30, 2);
        for kind in BAG_KINDS {
            let mut bag = ConformalBag::for_scorer(kind, 2, Some(9)).unwrap();
            for (t, row) in data.iter().enumerate() {
                bag.push(row);
                let start = (t + 1).saturating_sub(9);
                if t + 1 - start <= MIN_REFERENCE {
                    continue;
                }
                let expected = naive_scores(kind, &data[start..=t]);
                for (got, want) in bag.scores().iter().zip(&expected) {
                    assert!(
                        (got - want).abs() <= 1e-12 * want.max(1.0),
                        "{kind} t {t}: {got} vs {want}"
                    );
                }
            }
        }
    }

    #[test]
    fn eviction_recomputes_lost_nearest_neighbour() {
        let mut bag = ConformalBag::new(BagRule::Distance(DistanceAggregate::Min), 1, Some(3));
        for x in [0.0, 1.0, 100.0, 101.0] {
            bag.push(&[x]);
        }
        // 0 left the bag, so 1's nearest neighbour is now 100.
        assert_eq!(bag.scores(), &[99.0, 1.0, 1.0]);
        assert_eq!(bag.len(), 3);
    }

    #[test]
    fn current_ranked_among_member_scores() {
        let mut min = ConformalBag::new(BagRule::Distance(DistanceAggregate::Min), 1, None);
        let mut mean = ConformalBag::new(BagRule::Distance(DistanceAggregate::Mean), 1, None);
        for x in [0.0, 1.0, 2.0, 10.0] {
            min.push(&[x]);
            mean.push(&[x]);
        }
        assert_eq!(min.scores(), &[1.0, 1.0, 1.0, 8.0]);
        let expected = [13.0 / 3.0, 11.0 / 3.0, 11.0 / 3.0, 9.0];
        for (got, want) in mean.scores().iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
        // The far point is the strangest member: only itself is at least as strange.
        for bag in [&min, &mean] {
            let p = bag.p_values(0.5, TieTolerance::EXACT);
            assert!((p.deterministic - 0.25).abs() < 1e-12);
            assert!((p.randomized - 0.125).abs() < 1e-12);
        }
    }

    #[test]
    fn median_without_matches_recomputed_median() {
        let samples: [&[f64]; 4] = [
            &[5.0, 1.0, 3.0, 3.0, 9.0, -2.0, 3.0],
            &[4.0, 4.0, 4.0],
            &[0.5, -1.0, 2.0, 7.0],
            &[8.0, 6.0, 7.5, 1.0, 1.0, 0.0, 3.0, 2.5],
        ];
        for values in samples {
            let middle = Middle::of(values.to_vec());
            for i in 0..values.len() {
                let mut rest = values.to_vec();
                rest.remove(i);
                let got = middle.median_without(values[i]);
                assert_eq!(got, stats::median(&rest), "{values:?} without index {i}");
            }
        }
    }

    #[test]
    fn series_draws_one_uniform_per_row() {
        let table = FeatureTable::from_rows(&rows(25, 1)).unwrap();
        let bag = ConformalBag::for_scorer(ScorerKind::MeanDist, 1, None).unwrap();
        let (scores, p) = bag.clone().series(&table, TieTolerance::default(), 4);
        assert_eq!(scores.len(), 25);
        assert_eq!(p.len(), 25);
        assert_eq!(p.randomized[..2], [1.0, 1.0]);

        let mut replay = bag;
        let mut breaker = TieBreaker::new(4);
        for t in 0..table.rows() {
            assert_eq!(replay.push(table.row(t)), scores[t]);
            let pair = replay.p_values(breaker.next_uniform(), TieTolerance::default());
            assert_eq!(pair.randomized, p.randomized[t]);
        }
    }

    #[test]
    fn clear_empties_bag() {
        let mut bag = ConformalBag::new(BagRule::Distance(DistanceAggregate::Mean), 1, None);
        for x in [1.0, 2.0, 4.0] {
            bag.push(&[x]);
        }
        bag.clear();
        assert!(bag.is_empty());
        assert!(bag.scores().is_empty());
        assert_eq!(bag.push(&[7.0]), 0.0);
    }
}
