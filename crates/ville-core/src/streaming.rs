#![forbid(unsafe_code)]

//! One-observation-at-a-time wrapper around the pipeline.
//!
//! The monitor owns append-only histories of observations, scores and
//! wealth, plus the bounded leave-one-out bag for scorers that need one. It
//! is the single writer of that state (`observe` takes `&mut self`), and the
//! tie breaker advances exactly once per accepted observation. Given the same
//! series, configuration and seed it reproduces
//! [`Pipeline`](crate::pipeline::Pipeline) output bit for bit.
//!
//! Observations that fail validation are rejected without touching any
//! state, so a caller can drop a bad sample and continue.

use std::ops::Range;

use serde::Serialize;

use crate::bag::ConformalBag;
use crate::config::PipelineConfig;
use crate::detector::{ChangeDetector, PersistenceFilter, PersistenceState};
use crate::error::{VilleError, VilleResult};
use crate::martingale::{BettingMartingale, Martingale};
use crate::pvalue::{PValueEngine, TieBreaker};
use crate::scorer::{NonconformityScorer, Scorer, reference_start};
use crate::table::ReferenceView;

/// Result of one [`StreamingMonitor::observe`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub score: f64,
    pub p_det: f64,
    pub p_rnd: f64,
    pub wealth: f64,
    pub threshold: Option<f64>,
    pub crossing: bool,
    /// Indices that became detections at this step (a back-filled run on
    /// confirmation, then single indices while the run continues).
    pub newly_detected: Option<Range<usize>>,
}

impl StepOutcome {
    pub fn is_detection(&self) -> bool {
        self.newly_detected.is_some()
    }
}

/// Incremental change monitor over a `dim`-dimensional stream.
#[derive(Debug)]
pub struct StreamingMonitor {
    config: PipelineConfig,
    dim: usize,
    scorer: Scorer,
    engine: PValueEngine,
    /// Present for leave-one-out scorers, which keep their own members.
    bag: Option<ConformalBag>,
    breaker: TieBreaker,
    martingale: Martingale,
    detector: ChangeDetector,
    filter: PersistenceFilter,
    observations: Vec<f64>,
    scores: Vec<f64>,
    wealth: Vec<f64>,
    detections: Vec<bool>,
}

impl StreamingMonitor {
    pub fn new(config: PipelineConfig, dim: usize) -> VilleResult<Self> {
        config.validate()?;
        if dim == 0 {
            return Err(VilleError::EmptyTable);
        }
        let detector = ChangeDetector::from_config(&config);
        Ok(Self {
            dim,
            scorer: Scorer::from_kind(config.scorer),
            engine: PValueEngine::new(config.pvalue_window, config.tolerance, config.seed),
            bag: ConformalBag::for_scorer(config.scorer, dim, config.bag_capacity()),
            breaker: TieBreaker::new(config.seed),
            martingale: Martingale::from_config(&config),
            filter: detector.filter(),
            detector,
            observations: Vec::new(),
            scores: Vec::new(),
            wealth: Vec::new(),
            detections: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Observations accepted so far.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn wealth(&self) -> &[f64] {
        &self.wealth
    }

    pub fn detections(&self) -> &[bool] {
        &self.detections
    }

    pub fn state(&self) -> PersistenceState {
        self.filter.state()
    }

    pub fn observe_scalar(&mut self, value: f64) -> VilleResult<StepOutcome> {
        self.observe(&[value])
    }

    /// Score, calibrate, bet and test one observation.
    pub fn observe(&mut self, row: &[f64]) -> VilleResult<StepOutcome> {
        let t = self.scores.len();
        if row.len() != self.dim {
            return Err(VilleError::ShapeMismatch {
                row: t,
                expected: self.dim,
                found: row.len(),
            });
        }
        if let Some(column) = row.iter().position(|v| !v.is_finite()) {
            return Err(VilleError::NonFiniteObservation { row: t, column });
        }

        let (score, p) = match &mut self.bag {
            Some(bag) => {
                let score = bag.push(row);
                self.scores.push(score);
                (score, bag.p_values(self.breaker.next_uniform(), self.config.tolerance))
            }
            None => {
                let start = reference_start(t, self.config.reference_window);
                let reference =
                    ReferenceView::new(&self.observations[start * self.dim..], self.dim);
                let score = self.scorer.score(row, reference);
                self.observations.extend_from_slice(row);
                self.scores.push(score);
                let u = self.breaker.next_uniform();
                (score, self.engine.at(&self.scores, t, u))
            }
        };

        let wealth = self.martingale.update(p.randomized);
        self.wealth.push(wealth);

        let (threshold, crossing) = self.detector.crossing_at(&self.wealth, t);
        self.detections.push(false);
        let newly_detected = self.filter.step(t, crossing);
        if let Some(run) = &newly_detected {
            if run.start == 0 || !self.detections[run.start - 1] {
                tracing::info!(start = run.start, confirmed_at = t, wealth, "change confirmed");
            }
            for flag in &mut self.detections[run.clone()] {
                *flag = true;
            }
        }

        Ok(StepOutcome {
            index: t,
            score,
            p_det: p.deterministic,
            p_rnd: p.randomized,
            wealth,
            threshold,
            crossing,
            newly_detected,
        })
    }

    /// Back to an empty history with the original seed.
    pub fn reset(&mut self) {
        self.breaker = TieBreaker::new(self.config.seed);
        self.martingale.reset();
        self.filter.reset();
        if let Some(bag) = &mut self.bag {
            bag.clear();
        }
        self.observations.clear();
        self.scores.clear();
        self.wealth.clear();
        self.detections.clear();
    }
}
