#![forbid(unsafe_code)]

//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is plain data: serde-decodable, validated once, and
//! then resolved into strategy objects by [`crate::Pipeline::new`]. Nothing
//! downstream compares strategy names again.
//!
//! # JSON
//!
//! Every field has a default, so partial documents are accepted:
//!
//! ```json
//! {
//!   "scorer": "robust_mean_dev",
//!   "martingale": "simple_jumper",
//!   "threshold": { "mode": "adaptive", "window": 50, "threshold_mult": 4.0, "statistic": "median" },
//!   "min_consecutive": 3
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{VilleError, VilleResult};

/// Default Power martingale sensitivity.
pub const DEFAULT_EPSILON: f64 = 0.92;
/// Default Simple Jumper mixing probability.
pub const DEFAULT_JUMP_PROB: f64 = 0.01;
/// Default significance level.
pub const DEFAULT_ALPHA: f64 = 0.05;
/// Default trailing window of the adaptive threshold.
pub const DEFAULT_THRESHOLD_WINDOW: usize = 30;
/// Default adaptive multiplier over the trailing median wealth.
pub const DEFAULT_THRESHOLD_MULT: f64 = 5.0;
/// Default persistence requirement.
pub const DEFAULT_MIN_CONSECUTIVE: usize = 3;
/// Default tie-breaker seed.
pub const DEFAULT_SEED: u64 = 0x5EED_C0F0_4A11_0001;

// ─── Strategy names ──────────────────────────────────────────────────────

/// Nonconformity scorer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    /// `|x − mean| / (std + ε)`.
    #[default]
    MeanDev,
    /// `|x − median| / (1.4826·MAD + ε)`.
    RobustMeanDev,
    /// Minimum normalized distance to the reference rows.
    MinDist,
    /// Mean normalized distance to the reference rows.
    MeanDist,
    /// Ridge-regularized Mahalanobis distance to the reference mean.
    Mahalanobis,
}

impl ScorerKind {
    pub const ALL: [ScorerKind; 5] = [
        Self::MeanDev,
        Self::RobustMeanDev,
        Self::MinDist,
        Self::MeanDist,
        Self::Mahalanobis,
    ];

    /// How this scorer's p-values are calibrated.
    pub fn calibration(self) -> Calibration {
        match self {
            Self::MeanDev | Self::Mahalanobis => Calibration::ScoreHistory,
            Self::RobustMeanDev | Self::MinDist | Self::MeanDist => Calibration::LeaveOneOut,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MeanDev => "mean_dev",
            Self::RobustMeanDev => "robust_mean_dev",
            Self::MinDist => "min_dist",
            Self::MeanDist => "mean_dist",
            Self::Mahalanobis => "mahalanobis",
        }
    }
}

impl fmt::Display for ScorerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScorerKind {
    type Err = VilleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| VilleError::UnknownScorer(s.to_string()))
    }
}

/// Where a p-value's comparison scores come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Calibration {
    /// Rank the current score among earlier scores, each computed against
    /// its own trailing reference.
    ScoreHistory,
    /// Rescore every member of the bag (reference plus current) against the
    /// other members and rank the current point among those scores.
    LeaveOneOut,
}

/// Betting strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MartingaleKind {
    #[default]
    Power,
    SimpleJumper,
}

impl MartingaleKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::SimpleJumper => "simple_jumper",
        }
    }
}

impl fmt::Display for MartingaleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MartingaleKind {
    type Err = VilleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(Self::Power),
            "simple_jumper" => Ok(Self::SimpleJumper),
            other => Err(VilleError::UnknownMartingale(other.to_string())),
        }
    }
}

// ─── Sub-configurations ──────────────────────────────────────────────────

/// What counts as a tie between two scores: `|a − b| ≤ atol + rtol·|b|`.
///
/// Widening the tolerance turns near-equal scores into ties, which the
/// randomized p-value then spreads uniformly across the tied block. This
/// changes the randomized p-value distribution, so it is part of the
/// recorded configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieTolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for TieTolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-8,
        }
    }
}

impl TieTolerance {
    /// Exact equality only.
    pub const EXACT: TieTolerance = TieTolerance {
        rtol: 0.0,
        atol: 0.0,
    };

    #[inline]
    pub fn is_tie(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.atol + self.rtol * b.abs()
    }
}

/// Rolling statistic of trailing wealth used by the adaptive threshold.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveStatistic {
    #[default]
    Median,
    Mean,
    Max,
    /// Percentile `q ∈ [0, 100]`.
    Percentile(f64),
}

/// How the detection threshold is derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdMode {
    /// `M[t] > 1/alpha` (Ville's inequality).
    Fixed,
    /// `M[t] > threshold_mult × statistic(M[t−window..t])`.
    Adaptive {
        window: usize,
        threshold_mult: f64,
        #[serde(default)]
        statistic: AdaptiveStatistic,
    },
}

impl Default for ThresholdMode {
    fn default() -> Self {
        Self::Adaptive {
            window: DEFAULT_THRESHOLD_WINDOW,
            threshold_mult: DEFAULT_THRESHOLD_MULT,
            statistic: AdaptiveStatistic::Median,
        }
    }
}

/// Window sizes for post-hoc attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Points before the detection index.
    pub before: usize,
    /// Points from the detection index onward.
    pub after: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            before: 30,
            after: 10,
        }
    }
}

// ─── Pipeline configuration ──────────────────────────────────────────────

/// Full configuration of the scoring → p-value → martingale → detection
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub scorer: ScorerKind,
    /// Scorer reference size. `None` uses every prior observation.
    pub reference_window: Option<usize>,
    /// Conformal calibration window. `None` uses every prior score.
    pub pvalue_window: Option<usize>,
    pub martingale: MartingaleKind,
    /// Power martingale sensitivity, in `(0, 1)`.
    pub epsilon: f64,
    /// Simple Jumper mixing probability, in `[0, 1]`.
    pub jump_prob: f64,
    /// Significance level, in `(0, 1)`. Fixed threshold is `1/alpha`.
    pub alpha: f64,
    pub threshold: ThresholdMode,
    /// Consecutive crossings needed to confirm a detection.
    pub min_consecutive: usize,
    pub tolerance: TieTolerance,
    /// Seed of the randomized p-value tie breaker.
    pub seed: u64,
    pub attribution: AttributionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scorer: ScorerKind::default(),
            reference_window: None,
            pvalue_window: None,
            martingale: MartingaleKind::default(),
            epsilon: DEFAULT_EPSILON,
            jump_prob: DEFAULT_JUMP_PROB,
            alpha: DEFAULT_ALPHA,
            threshold: ThresholdMode::default(),
            min_consecutive: DEFAULT_MIN_CONSECUTIVE,
            tolerance: TieTolerance::default(),
            seed: DEFAULT_SEED,
            attribution: AttributionConfig::default(),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn with_scorer(mut self, scorer: ScorerKind) -> Self {
        self.scorer = scorer;
        self
    }

    #[must_use]
    pub fn with_martingale(mut self, martingale: MartingaleKind) -> Self {
        self.martingale = martingale;
        self
    }

    #[must_use]
    pub fn with_reference_window(mut self, window: Option<usize>) -> Self {
        self.reference_window = window;
        self
    }

    #[must_use]
    pub fn with_pvalue_window(mut self, window: Option<usize>) -> Self {
        self.pvalue_window = window;
        self
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn with_jump_prob(mut self, jump_prob: f64) -> Self {
        self.jump_prob = jump_prob;
        self
    }

    #[must_use]
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: ThresholdMode) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_min_consecutive(mut self, min_consecutive: usize) -> Self {
        self.min_consecutive = min_consecutive;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, tolerance: TieTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_attribution(mut self, attribution: AttributionConfig) -> Self {
        self.attribution = attribution;
        self
    }

    /// Fixed threshold `1/alpha`.
    /// Largest leave-one-out bag, current observation included: the
    /// reference window plus one, further bounded by the p-value window.
    pub fn bag_capacity(&self) -> Option<usize> {
        match (self.reference_window.map(|w| w + 1), self.pvalue_window) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    #[inline]
    pub fn fixed_threshold(&self) -> f64 {
        1.0 / self.alpha
    }

    /// Check every field against its domain.
    pub fn validate(&self) -> VilleResult<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(VilleError::invalid("alpha", self.alpha, "must lie in (0, 1)"));
        }
        if !(self.epsilon > 0.0 && self.epsilon < 1.0) {
            return Err(VilleError::invalid("epsilon", self.epsilon, "must lie in (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.jump_prob) {
            return Err(VilleError::invalid(
                "jump_prob",
                self.jump_prob,
                "must lie in [0, 1]",
            ));
        }
        if self.reference_window == Some(0) {
            return Err(VilleError::invalid("reference_window", 0, "must be positive"));
        }
        if self.pvalue_window == Some(0) {
            return Err(VilleError::invalid("pvalue_window", 0, "must be positive"));
        }
        if self.min_consecutive == 0 {
            return Err(VilleError::invalid("min_consecutive", 0, "must be at least 1"));
        }
        if let ThresholdMode::Adaptive {
            window,
            threshold_mult,
            statistic,
        } = self.threshold
        {
            if window == 0 {
                return Err(VilleError::invalid("threshold.window", 0, "must be positive"));
            }
            if !(threshold_mult.is_finite() && threshold_mult > 0.0) {
                return Err(VilleError::invalid(
                    "threshold.threshold_mult",
                    threshold_mult,
                    "must be finite and positive",
                ));
            }
            if let AdaptiveStatistic::Percentile(q) = statistic
                && !(0.0..=100.0).contains(&q)
            {
                return Err(VilleError::invalid(
                    "threshold.statistic",
                    q,
                    "percentile must lie in [0, 100]",
                ));
            }
        }
        let TieTolerance { rtol, atol } = self.tolerance;
        if !(rtol.is_finite() && rtol >= 0.0 && atol.is_finite() && atol >= 0.0) {
            return Err(VilleError::invalid(
                "tolerance",
                format!("rtol={rtol}, atol={atol}"),
                "must be finite and non-negative",
            ));
        }
        if self.attribution.before < 2 {
            return Err(VilleError::invalid(
                "attribution.before",
                self.attribution.before,
                "needs at least 2 points",
            ));
        }
        if self.attribution.after == 0 {
            return Err(VilleError::invalid("attribution.after", 0, "must be positive"));
        }
        Ok(())
    }

    /// Decode and validate a JSON document.
    ///
    /// Unknown strategy names surface as [`VilleError::UnknownScorer`] or
    /// [`VilleError::UnknownMartingale`] rather than a generic parse error.
    pub fn from_json_str(doc: &str) -> VilleResult<Self> {
        let value: serde_json::Value = serde_json::from_str(doc)?;
        if let Some(name) = value.get("scorer").and_then(serde_json::Value::as_str) {
            name.parse::<ScorerKind>()?;
        }
        if let Some(name) = value.get("martingale").and_then(serde_json::Value::as_str) {
            name.parse::<MartingaleKind>()?;
        }
        let config: PipelineConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a compact JSON document.
    pub fn to_json(&self) -> String {
        // Plain data with string keys: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
