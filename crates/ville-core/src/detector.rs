#![forbid(unsafe_code)]

//! Threshold crossing with a persistence filter.
//!
//! # Thresholds
//!
//! ```text
//! Fixed:     bound_t = 1/α
//! Adaptive:  bound_t = mult × stat({ M_s : t−w ≤ s < t, M_s finite })
//! crossing_t = M_t finite ∧ bound_t exists ∧ M_t > bound_t
//! ```
//!
//! The fixed bound is Ville's inequality: under the null the wealth ever
//! reaching `1/α` has probability at most `α`. The adaptive bound tracks
//! the wealth's own recent level, so it reacts to a fresh surge instead of
//! to slow drift accumulated over a long stable run. The trailing window
//! never includes `t` itself, and an empty window yields no bound (no
//! crossing).
//!
//! # Persistence
//!
//! ```text
//!            crossing              crossing, n+1 < k
//!   Below ───────────▶ Armed(1) ─────────────────▶ Armed(n+1)
//!     ▲                   │  n+1 ≥ k                   │
//!     │ no crossing       ▼                            ▼
//!     └────────────── Confirmed ◀──────────────────────┘
//! ```
//!
//! On confirmation the whole run of `k = min_consecutive` points is marked.
//! Further crossings while confirmed are marked one by one. Any
//! non-crossing returns to `Below`. With `k = 1` the detections equal the
//! raw crossings.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `M_t` NaN / ±Inf | non-crossing, counted in diagnostics |
//! | non-finite history values | skipped by the adaptive statistic |
//! | empty trailing window | no bound, non-crossing |
//! | `min_consecutive = 0` | treated as `1` |

use std::ops::Range;

use serde::Serialize;

use crate::config::{AdaptiveStatistic, DEFAULT_ALPHA, PipelineConfig, ThresholdMode};
use crate::stats;

// ─── Persistence filter ──────────────────────────────────────────────────

/// Per-index state of the persistence filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceState {
    #[default]
    Below,
    /// Inside a run of this many consecutive crossings, not yet confirmed.
    Armed(usize),
    Confirmed,
}

/// Confirms runs of at least `min_consecutive` crossings.
#[derive(Debug, Clone)]
pub struct PersistenceFilter {
    min_consecutive: usize,
    state: PersistenceState,
    run_start: usize,
}

impl PersistenceFilter {
    pub fn new(min_consecutive: usize) -> Self {
        Self {
            min_consecutive: min_consecutive.max(1),
            state: PersistenceState::Below,
            run_start: 0,
        }
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    pub fn min_consecutive(&self) -> usize {
        self.min_consecutive
    }

    /// Advance with the crossing flag of index `t`. Returns the indices that
    /// become detections at this step, if any.
    pub fn step(&mut self, t: usize, crossing: bool) -> Option<Range<usize>> {
        if !crossing {
            self.state = PersistenceState::Below;
            return None;
        }
        let count = match self.state {
            PersistenceState::Confirmed => return Some(t..t + 1),
            PersistenceState::Below => {
                self.run_start = t;
                1
            }
            PersistenceState::Armed(n) => n + 1,
        };
        if count >= self.min_consecutive {
            self.state = PersistenceState::Confirmed;
            Some(self.run_start..t + 1)
        } else {
            self.state = PersistenceState::Armed(count);
            None
        }
    }

    pub fn reset(&mut self) {
        self.state = PersistenceState::Below;
        self.run_start = 0;
    }
}

// ─── Report types ────────────────────────────────────────────────────────

/// A raw threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DetectionEvent {
    pub index: usize,
    /// True when the crossing belongs to a confirmed run.
    pub persisted: bool,
}

/// Per-index detail behind a [`DetectionReport`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionDiagnostics {
    /// Bound in force at each index (`None` when none could be formed).
    pub thresholds: Vec<Option<f64>>,
    /// Raw crossing flags.
    pub crossings: Vec<bool>,
    /// Confirmed runs, each extended through its trailing crossings.
    pub confirmed_runs: Vec<Range<usize>>,
    /// Wealth values that were NaN or infinite.
    pub non_finite: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
    pub detections: Vec<bool>,
    pub events: Vec<DetectionEvent>,
    pub diagnostics: DetectionDiagnostics,
}

impl DetectionReport {
    /// Indices flagged as detections, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.detections
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| d.then_some(i))
            .collect()
    }

    /// Start index of each confirmed run.
    pub fn run_starts(&self) -> Vec<usize> {
        self.diagnostics.confirmed_runs.iter().map(|r| r.start).collect()
    }
}

// ─── Detector ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    mode: ThresholdMode,
    alpha: f64,
    min_consecutive: usize,
}

impl ChangeDetector {
    /// `alpha` sets the fixed bound `1/alpha`; it is unused in adaptive mode.
    pub fn new(mode: ThresholdMode, alpha: f64, min_consecutive: usize) -> Self {
        Self {
            mode,
            alpha,
            min_consecutive: min_consecutive.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.threshold, config.alpha, config.min_consecutive)
    }

    pub fn mode(&self) -> ThresholdMode {
        self.mode
    }

    pub fn min_consecutive(&self) -> usize {
        self.min_consecutive
    }

    pub fn filter(&self) -> PersistenceFilter {
        PersistenceFilter::new(self.min_consecutive)
    }

    /// Bound applied at index `t`, computed from `history[..t]`.
    pub fn threshold_at(&self, history: &[f64], t: usize) -> Option<f64> {
        match self.mode {
            ThresholdMode::Fixed => Some(1.0 / self.alpha),
            ThresholdMode::Adaptive {
                window,
                threshold_mult,
                statistic,
            } => {
                let end = t.min(history.len());
                let trailing: Vec<f64> = history[end.saturating_sub(window)..end]
                    .iter()
                    .copied()
                    .filter(|v| v.is_finite())
                    .collect();
                if trailing.is_empty() {
                    return None;
                }
                let level = match statistic {
                    AdaptiveStatistic::Median => stats::median(&trailing),
                    AdaptiveStatistic::Mean => stats::mean(&trailing),
                    AdaptiveStatistic::Max => trailing.iter().copied().fold(f64::MIN, f64::max),
                    AdaptiveStatistic::Percentile(q) => stats::percentile(&trailing, q),
                };
                Some(threshold_mult * level)
            }
        }
    }

    /// Raw crossing test for index `t` of `history`.
    pub fn crossing_at(&self, history: &[f64], t: usize) -> (Option<f64>, bool) {
        let bound = self.threshold_at(history, t);
        let value = history[t];
        let crossing = value.is_finite() && bound.is_some_and(|b| value > b);
        (bound, crossing)
    }

    /// Detections over a whole wealth series.
    pub fn detect(&self, martingale: &[f64]) -> DetectionReport {
        let _span = tracing::debug_span!("ville.detect", len = martingale.len()).entered();
        let n = martingale.len();
        let mut filter = self.filter();
        let mut report = DetectionReport {
            detections: vec![false; n],
            events: Vec::new(),
            diagnostics: DetectionDiagnostics {
                thresholds: Vec::with_capacity(n),
                crossings: Vec::with_capacity(n),
                ..DetectionDiagnostics::default()
            },
        };

        for t in 0..n {
            if !martingale[t].is_finite() {
                report.diagnostics.non_finite += 1;
                tracing::debug!(
                    index = t,
                    value = martingale[t],
                    "non-finite wealth treated as non-crossing"
                );
            }
            let (bound, crossing) = self.crossing_at(martingale, t);
            report.diagnostics.thresholds.push(bound);
            report.diagnostics.crossings.push(crossing);

            if let Some(marked) = filter.step(t, crossing) {
                let runs = &mut report.diagnostics.confirmed_runs;
                match runs.last_mut() {
                    Some(run) if run.end == marked.start => run.end = marked.end,
                    _ => {
                        tracing::info!(
                            start = marked.start,
                            confirmed_at = t,
                            wealth = martingale[t],
                            threshold = ?bound,
                            "change confirmed"
                        );
                        runs.push(marked.clone());
                    }
                }
                for flag in &mut report.detections[marked] {
                    *flag = true;
                }
            }
        }

        report.events = report
            .diagnostics
            .crossings
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c)
            .map(|(index, _)| DetectionEvent {
                index,
                persisted: report.detections[index],
            })
            .collect();

        if report.diagnostics.non_finite > 0 {
            tracing::warn!(
                count = report.diagnostics.non_finite,
                "wealth series contained non-finite values"
            );
        }
        report
    }
}

/// Adaptive-median detection: indices flagged plus diagnostics.
pub fn detect(
    martingale: &[f64],
    window: usize,
    threshold_mult: f64,
    min_consecutive: usize,
) -> (Vec<usize>, DetectionDiagnostics) {
    let detector = ChangeDetector::new(
        ThresholdMode::Adaptive {
            window,
            threshold_mult,
            statistic: AdaptiveStatistic::Median,
        },
        DEFAULT_ALPHA,
        min_consecutive,
    );
    let report = detector.detect(martingale);
    (report.indices(), report.diagnostics)
}
