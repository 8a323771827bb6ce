#![forbid(unsafe_code)]

//! Deterministic synthetic streams for calibration and detection runs.
//!
//! Every scenario is a pure function of its [`ScenarioConfig`]: the same
//! seed yields the same series on every platform. Gaussian noise uses the
//! Box–Muller transform over a seeded [`StdRng`].
//!
//! # Usage
//!
//! ```
//! use ville_harness::scenario::{ScenarioConfig, StreamPattern};
//!
//! let series = ScenarioConfig::default()
//!     .with_seed(42)
//!     .with_pattern(StreamPattern::MeanShift { at: 200, delta: 5.0 })
//!     .generate();
//! assert_eq!(series.len(), 400);
//! ```

use std::f64::consts::TAU;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use ville_core::{FeatureTable, VilleResult};

/// Shape of a synthetic stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum StreamPattern {
    /// i.i.d. N(0, σ²) throughout.
    Stationary,
    /// Mean jumps by `delta` at index `at`.
    MeanShift { at: usize, delta: f64 },
    /// Standard deviation is multiplied by `factor` from index `at`.
    VarianceShift { at: usize, factor: f64 },
    /// Values drawn uniformly from `levels` integers, so exact ties abound.
    TieHeavy { levels: u32 },
}

impl StreamPattern {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stationary => "stationary",
            Self::MeanShift { .. } => "mean_shift",
            Self::VarianceShift { .. } => "variance_shift",
            Self::TieHeavy { .. } => "tie_heavy",
        }
    }

    /// Index where the distribution changes, if it does.
    pub fn change_point(&self) -> Option<usize> {
        match *self {
            Self::MeanShift { at, .. } | Self::VarianceShift { at, .. } => Some(at),
            Self::Stationary | Self::TieHeavy { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioConfig {
    pub len: usize,
    pub seed: u64,
    /// Base noise standard deviation.
    pub sigma: f64,
    pub pattern: StreamPattern,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            len: 400,
            seed: 0,
            sigma: 1.0,
            pattern: StreamPattern::Stationary,
        }
    }
}

impl ScenarioConfig {
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: StreamPattern) -> Self {
        self.pattern = pattern;
        self
    }

    #[must_use]
    pub fn with_len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    #[must_use]
    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = sigma;
        self
    }

    /// The univariate series.
    pub fn generate(&self) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        self.draw(&mut rng, &self.pattern)
    }

    /// `cols` columns of independent noise. Column `shifted_column` follows
    /// the configured pattern; the rest are stationary.
    pub fn generate_table(&self, cols: usize, shifted_column: usize) -> VilleResult<FeatureTable> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let columns = (0..cols)
            .map(|j| {
                let pattern = if j == shifted_column {
                    &self.pattern
                } else {
                    &StreamPattern::Stationary
                };
                (format!("feature_{j}"), self.draw(&mut rng, pattern))
            })
            .collect();
        FeatureTable::from_columns(columns)
    }

    fn draw(&self, rng: &mut StdRng, pattern: &StreamPattern) -> Vec<f64> {
        (0..self.len)
            .map(|i| match *pattern {
                StreamPattern::Stationary => self.sigma * gaussian(rng),
                StreamPattern::MeanShift { at, delta } => {
                    let level = if i >= at { delta } else { 0.0 };
                    level + self.sigma * gaussian(rng)
                }
                StreamPattern::VarianceShift { at, factor } => {
                    let scale = if i >= at { factor } else { 1.0 };
                    scale * self.sigma * gaussian(rng)
                }
                StreamPattern::TieHeavy { levels } => f64::from(rng.gen_range(0..levels.max(1))),
            })
            .collect()
    }
}

/// Standard normal draw by Box–Muller.
pub fn gaussian(rng: &mut StdRng) -> f64 {
    // 1 − U keeps the log argument in (0, 1].
    let u1: f64 = 1.0 - rng.gen_range(0.0..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}
