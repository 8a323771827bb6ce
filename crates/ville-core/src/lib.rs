#![forbid(unsafe_code)]

//! Ville Core
//!
//! Online change detection with conformal martingales. A stream of
//! observations is turned into nonconformity scores, the scores into
//! conformal p-values, the p-values into the wealth of a betting
//! martingale, and the wealth into detections.
//!
//! # Key Components
//!
//! - [`NonconformityScorer`] - Strangeness of an observation against a reference
//! - [`PValueEngine`] - Deterministic and randomized conformal p-values
//! - [`ConformalBag`] - Leave-one-out calibration for distance and robust scorers
//! - [`PowerMartingale`] / [`SimpleJumper`] - Betting strategies
//! - [`ChangeDetector`] - Fixed or adaptive threshold plus persistence filter
//! - [`Pipeline`] - Batch orchestration with multivariate attribution
//! - [`StreamingMonitor`] - One observation at a time, identical to batch
//!
//! # Guarantee
//!
//! Under exchangeable data the randomized p-values are i.i.d. Uniform(0, 1),
//! the wealth is a nonnegative martingale, and Ville's inequality bounds the
//! probability that it ever reaches `1/α` by `α`.
//!
//! # Example
//!
//! ```
//! use ville_core::{Pipeline, PipelineConfig};
//!
//! let mut series: Vec<f64> = (0..200).map(|i| ((i * 37) % 11) as f64 / 11.0).collect();
//! series.extend((0..100).map(|i| 6.0 + ((i * 37) % 11) as f64 / 11.0));
//!
//! let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
//! let output = pipeline.run(&series).unwrap();
//! assert_eq!(output.martingale.len(), series.len());
//! ```

pub mod attribution;
pub mod bag;
pub mod config;
pub mod detector;
pub mod error;
pub mod martingale;
pub mod pipeline;
pub mod pvalue;
pub mod scorer;
pub mod stats;
pub mod streaming;
pub mod table;

pub use attribution::{Attribution, FeatureContribution, attribute};
pub use bag::{BagRule, ConformalBag};
pub use config::{
    AdaptiveStatistic, AttributionConfig, Calibration, MartingaleKind, PipelineConfig,
    ScorerKind, ThresholdMode, TieTolerance,
};
pub use detector::{
    ChangeDetector, DetectionDiagnostics, DetectionEvent, DetectionReport, PersistenceFilter,
    PersistenceState, detect,
};
pub use error::{VilleError, VilleResult};
pub use martingale::{
    BettingMartingale, Martingale, PowerMartingale, SimpleJumper, WEALTH_MAX, WEALTH_MIN,
    power_martingale_cumprod,
};
pub use pipeline::{MultivariateReport, Pipeline, PipelineOutput, StreamReport};
pub use pvalue::{ConformalPValues, P_FLOOR, PValueEngine, PValuePair, conformal_p_value};
pub use scorer::{NonconformityScorer, Scorer, score_series};
pub use streaming::{StepOutcome, StreamingMonitor};
pub use table::{FeatureTable, ReferenceView};
