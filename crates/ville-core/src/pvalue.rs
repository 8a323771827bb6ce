#![forbid(unsafe_code)]

//! Conformal p-values over a growing or sliding score history.
//!
//! # Mathematical Model
//!
//! For index `n` let `W` be the calibration window: every score in `[0..=n]`,
//! or the last `w` of them when windowed. The window always includes the
//! current score `s_n`.
//!
//! ```text
//! p_det[n] = |{ i ∈ W : s_i ≥ s_n }| / |W|
//!
//! G = |{ i ∈ W : s_i > s_n, not tied }|
//! E = |{ i ∈ W : s_i tied with s_n }|          (E ≥ 1: s_n ties itself)
//! p_rnd[n] = (G + u·E) / |W|,    u ~ Uniform(0, 1)
//! ```
//!
//! With `n` prior scores in the window, `|W| = n + 1`: this is the (n+1)
//! rule. Under exchangeability `p_rnd` is exactly Uniform(0, 1), and the
//! sequence of randomized p-values is independent.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `n = 0` | both p-values `1.0` |
//! | `u·E + G = 0` | floored at [`P_FLOOR`] |
//! | heavy ties | spread uniformly over the tied block |
//!
//! # Randomness
//!
//! A [`TieBreaker`] is seeded once and draws exactly one uniform per index,
//! including index 0 whose draw is discarded. Batch and incremental callers
//! therefore see the same `u` at the same index.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TieTolerance;

/// Lower bound on emitted p-values, keeping `p^(ε−1)` finite.
pub const P_FLOOR: f64 = 1e-10;

/// Deterministic and randomized p-value for one index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PValuePair {
    pub deterministic: f64,
    pub randomized: f64,
}

impl PValuePair {
    /// Warm-up sentinel: no evidence against the null.
    pub const NO_EVIDENCE: PValuePair = PValuePair {
        deterministic: 1.0,
        randomized: 1.0,
    };
}

/// Parallel p-value arrays, same length as the scores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConformalPValues {
    pub deterministic: Vec<f64>,
    pub randomized: Vec<f64>,
}

impl ConformalPValues {
    pub fn len(&self) -> usize {
        self.randomized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.randomized.is_empty()
    }
}

/// Seeded source of tie-breaking uniforms, one per index.
#[derive(Debug, Clone)]
pub struct TieBreaker {
    rng: StdRng,
}

impl TieBreaker {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next draw from `[0, 1)`.
    #[inline]
    pub fn next_uniform(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }
}

/// P-values of `current` against `window` (which must contain `current`),
/// with tie-breaking draw `u`.
pub fn conformal_p_value(
    window: &[f64],
    current: f64,
    u: f64,
    tolerance: TieTolerance,
) -> PValuePair {
    if window.is_empty() {
        return PValuePair::NO_EVIDENCE;
    }
    let mut at_least = 0usize;
    let mut greater = 0usize;
    let mut tied = 0usize;
    for &s in window {
        if s >= current {
            at_least += 1;
        }
        if tolerance.is_tie(s, current) {
            tied += 1;
        } else if s > current {
            greater += 1;
        }
    }
    let size = window.len() as f64;
    PValuePair {
        deterministic: clamp_p(at_least as f64 / size),
        randomized: clamp_p((greater as f64 + u * tied as f64) / size),
    }
}

#[inline]
fn clamp_p(p: f64) -> f64 {
    p.clamp(P_FLOOR, 1.0)
}

/// Start of the calibration window for index `n`.
#[inline]
pub fn window_start(n: usize, window: Option<usize>) -> usize {
    window.map_or(0, |w| (n + 1).saturating_sub(w))
}

/// Batch p-value computation over a full score array.
#[derive(Debug, Clone)]
pub struct PValueEngine {
    window: Option<usize>,
    tolerance: TieTolerance,
    seed: u64,
}

impl PValueEngine {
    pub fn new(window: Option<usize>, tolerance: TieTolerance, seed: u64) -> Self {
        Self {
            window,
            tolerance,
            seed,
        }
    }

    pub fn window(&self) -> Option<usize> {
        self.window
    }

    pub fn tolerance(&self) -> TieTolerance {
        self.tolerance
    }

    /// P-values for index `n` given the score history `scores[..=n]` and the
    /// draw for this index.
    pub fn at(&self, scores: &[f64], n: usize, u: f64) -> PValuePair {
        if n == 0 {
            return PValuePair::NO_EVIDENCE;
        }
        let start = window_start(n, self.window);
        conformal_p_value(&scores[start..=n], scores[n], u, self.tolerance)
    }

    /// Deterministic and randomized p-values for every score.
    pub fn p_values(&self, scores: &[f64]) -> ConformalPValues {
        let mut breaker = TieBreaker::new(self.seed);
        let mut out = ConformalPValues {
            deterministic: Vec::with_capacity(scores.len()),
            randomized: Vec::with_capacity(scores.len()),
        };
        for n in 0..scores.len() {
            let u = breaker.next_uniform();
            let pair = self.at(scores, n, u);
            out.deterministic.push(pair.deterministic);
            out.randomized.push(pair.randomized);
        }
        out
    }
}
