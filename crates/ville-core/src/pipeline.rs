#![forbid(unsafe_code)]

//! Batch orchestration: scores → p-values → wealth → detections.
//!
//! A [`Pipeline`] is built once from a validated [`PipelineConfig`] and can
//! replay any number of series. Every run is a pure function of the input
//! and the configured seed.
//!
//! Scorers calibrated on their score history go through [`score_series`]
//! and [`PValueEngine`]. Leave-one-out scorers go through a
//! [`ConformalBag`], which yields scores and p-values together.
//!
//! # Multivariate runs
//!
//! [`Pipeline::run_multivariate`] processes each column as its own
//! univariate stream, each with a tie-breaker seed derived from the
//! configured seed. The joint stream scores full row vectors with the
//! configured scorer. Each distinct confirmed-run start across all streams
//! gets one [`Attribution`].

use serde::Serialize;

use crate::attribution::{Attribution, attribute};
use crate::bag::ConformalBag;
use crate::config::PipelineConfig;
use crate::detector::{ChangeDetector, DetectionReport};
use crate::error::VilleResult;
use crate::martingale::{BettingMartingale, Martingale};
use crate::pvalue::PValueEngine;
use crate::scorer::{NonconformityScorer, Scorer, score_series};
use crate::table::FeatureTable;

/// Parallel arrays produced by one run, plus detection detail.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub scores: Vec<f64>,
    pub p_det: Vec<f64>,
    pub p_rnd: Vec<f64>,
    pub martingale: Vec<f64>,
    pub detections: Vec<bool>,
    pub report: DetectionReport,
}

impl PipelineOutput {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn detection_indices(&self) -> Vec<usize> {
        self.report.indices()
    }

    pub fn first_detection(&self) -> Option<usize> {
        self.detections.iter().position(|&d| d)
    }

    /// Largest wealth reached.
    pub fn max_wealth(&self) -> f64 {
        self.martingale.iter().copied().fold(0.0, f64::max)
    }
}

/// One named univariate stream of a multivariate run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamReport {
    pub feature: String,
    pub output: PipelineOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultivariateReport {
    pub features: Vec<StreamReport>,
    pub joint: PipelineOutput,
    /// One per distinct confirmed-run start, ascending by index.
    pub attributions: Vec<Attribution>,
}

impl MultivariateReport {
    /// Earliest detection in any stream.
    pub fn first_detection(&self) -> Option<usize> {
        self.features
            .iter()
            .map(|f| &f.output)
            .chain(std::iter::once(&self.joint))
            .filter_map(PipelineOutput::first_detection)
            .min()
    }
}

/// Tie-breaker seed of stream `index`, decorrelated from the base seed.
pub fn stream_seed(seed: u64, index: usize) -> u64 {
    splitmix64(seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Configured detection pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    scorer: Scorer,
    detector: ChangeDetector,
}

impl Pipeline {
    /// Validate `config` and resolve its strategies.
    pub fn new(config: PipelineConfig) -> VilleResult<Self> {
        config.validate()?;
        let scorer = Scorer::from_kind(config.scorer);
        let detector = ChangeDetector::from_config(&config);
        tracing::debug!(
            scorer = config.scorer.name(),
            martingale = config.martingale.name(),
            threshold = ?config.threshold,
            min_consecutive = config.min_consecutive,
            seed = config.seed,
            "pipeline configured"
        );
        Ok(Self {
            config,
            scorer,
            detector,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Univariate series.
    pub fn run(&self, series: &[f64]) -> VilleResult<PipelineOutput> {
        let table = FeatureTable::univariate(series)?;
        Ok(self.run_table(&table))
    }

    /// Joint vector stream over every row of `table`.
    pub fn run_table(&self, table: &FeatureTable) -> PipelineOutput {
        self.run_seeded(table, self.config.seed)
    }

    /// Each column separately, the joint stream, and attributions.
    pub fn run_multivariate(&self, table: &FeatureTable) -> VilleResult<MultivariateReport> {
        let _span = tracing::info_span!(
            "ville.pipeline.multivariate",
            rows = table.rows(),
            cols = table.cols()
        )
        .entered();

        let mut features = Vec::with_capacity(table.cols());
        for (j, name) in table.names().iter().enumerate() {
            let column = FeatureTable::univariate(&table.column(j))?.with_names([name.as_str()]);
            let output = self.run_seeded(&column, stream_seed(self.config.seed, j));
            features.push(StreamReport {
                feature: name.clone(),
                output,
            });
        }
        let joint = self.run_table(table);

        let mut starts: Vec<usize> = features
            .iter()
            .map(|f| &f.output)
            .chain(std::iter::once(&joint))
            .flat_map(|o| o.report.run_starts())
            .collect();
        starts.sort_unstable();
        starts.dedup();

        let attributions: Vec<Attribution> = starts
            .into_iter()
            .map(|t| attribute(table, t, &self.config.attribution))
            .collect();
        for a in &attributions {
            if let Some(top) = a.top() {
                tracing::info!(
                    index = a.detection_index,
                    feature = %top.feature,
                    share = top.share,
                    "attributed change"
                );
            }
        }

        Ok(MultivariateReport {
            features,
            joint,
            attributions,
        })
    }

    fn run_seeded(&self, table: &FeatureTable, seed: u64) -> PipelineOutput {
        let _span = tracing::debug_span!(
            "ville.pipeline.run",
            rows = table.rows(),
            scorer = self.scorer.kind().name()
        )
        .entered();

        let config = &self.config;
        let bag = ConformalBag::for_scorer(self.scorer.kind(), table.cols(), config.bag_capacity());
        let (scores, p) = match bag {
            Some(bag) => bag.series(table, config.tolerance, seed),
            None => {
                let scores = score_series(&self.scorer, table, config.reference_window);
                let p = PValueEngine::new(config.pvalue_window, config.tolerance, seed)
                    .p_values(&scores);
                (scores, p)
            }
        };
        let martingale = Martingale::from_config(&self.config).process(&p.randomized);
        let report = self.detector.detect(&martingale);

        tracing::debug!(
            detections = report.diagnostics.confirmed_runs.len(),
            max_wealth = martingale.iter().copied().fold(0.0, f64::max),
            "pipeline run complete"
        );

        PipelineOutput {
            scores,
            p_det: p.deterministic,
            p_rnd: p.randomized,
            martingale,
            detections: report.detections.clone(),
            report,
        }
    }
}
