#![forbid(unsafe_code)]

//! Scenario runner shared by the binary and the integration tests.
//!
//! Each scenario generates its data, runs the pipeline, writes the JSONL
//! ledger, and reports whether its built-in checks held:
//!
//! | Scenario | Check |
//! |----------|-------|
//! | stationary | KS uniformity of `p_rnd` |
//! | mean-shift / variance-shift | a detection at or after the change, none before |
//! | ties | every `p_rnd` in `(0, 1]` |
//! | multivariate | the shifted feature tops the first post-change attribution |
//! | ville | false-alarm rate ≤ α + 3·SE for both strategies |

use std::fmt;
use std::io::{self, Write};

use ville_core::{MartingaleKind, Pipeline, PipelineConfig, VilleError};

use crate::calibration::{ks_uniform, ville_false_alarm_rate};
use crate::cli::{Opts, Scenario};
use crate::evidence::{EvidenceLedger, EvidenceRecord};
use crate::scenario::{ScenarioConfig, StreamPattern};

/// Stream length of the `ville` scenario when `--len` is absent.
pub const DEFAULT_VILLE_LEN: usize = 1_000;

/// Stream length of the `stationary` scenario when `--len` is absent.
pub const DEFAULT_STATIONARY_LEN: usize = 1_000;

/// Monte Carlo allowance, in standard errors, for the Ville check.
pub const VILLE_SIGMAS: f64 = 3.0;

#[derive(Debug)]
pub enum HarnessError {
    Io(io::Error),
    Pipeline(VilleError),
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "ledger I/O error: {e}"),
            Self::Pipeline(e) => write!(f, "pipeline error: {e}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Pipeline(e) => Some(e),
        }
    }
}

impl From<io::Error> for HarnessError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<VilleError> for HarnessError {
    fn from(e: VilleError) -> Self {
        Self::Pipeline(e)
    }
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub scenario: Scenario,
    /// First detection per stream, in ledger order.
    pub first_detections: Vec<(String, Option<usize>)>,
    pub checks_passed: bool,
}

/// Run `opts.scenario` with `config`, writing evidence to `ledger`.
pub fn run_scenario<W: Write>(
    opts: &Opts,
    config: &PipelineConfig,
    ledger: &mut EvidenceLedger<W>,
) -> Result<RunSummary, HarnessError> {
    let _span = tracing::info_span!(
        "ville.harness.scenario",
        scenario = opts.scenario.name(),
        seed = opts.seed
    )
    .entered();
    let config = config.clone().with_seed(opts.seed);
    ledger.record_config(&config)?;

    let summary = match opts.scenario {
        Scenario::Stationary => {
            let len = opts.len.unwrap_or(DEFAULT_STATIONARY_LEN);
            let series = base(opts, len).generate();
            let output = Pipeline::new(config)?.run(&series)?;
            let ks = ks_uniform(&output.p_rnd);
            ledger.record(&EvidenceRecord::Uniformity { stream: "value", ks })?;
            ledger.record_output("value", &output)?;
            RunSummary {
                scenario: opts.scenario,
                first_detections: vec![("value".into(), output.first_detection())],
                checks_passed: ks.passes,
            }
        }
        Scenario::MeanShift | Scenario::VarianceShift => {
            let len = opts.len.unwrap_or(400);
            let at = len / 2;
            let pattern = if opts.scenario == Scenario::MeanShift {
                StreamPattern::MeanShift { at, delta: 5.0 }
            } else {
                StreamPattern::VarianceShift { at, factor: 4.0 }
            };
            let series = base(opts, len).with_pattern(pattern).generate();
            let output = Pipeline::new(config)?.run(&series)?;
            ledger.record_output("value", &output)?;
            let first = output.first_detection();
            RunSummary {
                scenario: opts.scenario,
                first_detections: vec![("value".into(), first)],
                checks_passed: first.is_some_and(|f| f >= at),
            }
        }
        Scenario::Ties => {
            let len = opts.len.unwrap_or(400);
            let series = base(opts, len)
                .with_pattern(StreamPattern::TieHeavy { levels: 4 })
                .generate();
            let output = Pipeline::new(config)?.run(&series)?;
            ledger.record_output("value", &output)?;
            RunSummary {
                scenario: opts.scenario,
                first_detections: vec![("value".into(), output.first_detection())],
                checks_passed: output.p_rnd.iter().all(|&p| p > 0.0 && p <= 1.0),
            }
        }
        Scenario::Multivariate => {
            let len = opts.len.unwrap_or(400);
            let at = len / 2;
            let table = base(opts, len)
                .with_pattern(StreamPattern::MeanShift { at, delta: 5.0 })
                .generate_table(3, 1)?;
            let report = Pipeline::new(config)?.run_multivariate(&table)?;
            let mut first_detections = Vec::with_capacity(report.features.len() + 1);
            for stream in &report.features {
                ledger.record_output(&stream.feature, &stream.output)?;
                first_detections.push((stream.feature.clone(), stream.output.first_detection()));
            }
            ledger.record_output("joint", &report.joint)?;
            first_detections.push(("joint".into(), report.joint.first_detection()));
            for attribution in &report.attributions {
                ledger.record_attribution(attribution)?;
            }
            let shifted = &table.names()[1];
            let checks_passed = report
                .attributions
                .iter()
                .find(|a| a.detection_index >= at)
                .and_then(|a| a.top())
                .is_some_and(|top| &top.feature == shifted);
            RunSummary {
                scenario: opts.scenario,
                first_detections,
                checks_passed,
            }
        }
        Scenario::Ville => {
            let len = opts.len.unwrap_or(DEFAULT_VILLE_LEN);
            let mut checks_passed = true;
            for (i, kind) in [MartingaleKind::Power, MartingaleKind::SimpleJumper]
                .into_iter()
                .enumerate()
            {
                let seed = opts.seed.wrapping_add(i as u64);
                let report = ville_false_alarm_rate(kind, opts.runs, len, config.alpha, seed);
                ledger.record(&EvidenceRecord::Ville { report: &report })?;
                checks_passed &= report.within_bound(VILLE_SIGMAS);
            }
            RunSummary {
                scenario: opts.scenario,
                first_detections: Vec::new(),
                checks_passed,
            }
        }
    };

    ledger.flush()?;
    if summary.checks_passed {
        tracing::info!(scenario = summary.scenario.name(), "scenario checks passed");
    } else {
        tracing::warn!(scenario = summary.scenario.name(), "scenario checks failed");
    }
    Ok(summary)
}

fn base(opts: &Opts, len: usize) -> ScenarioConfig {
    ScenarioConfig::default().with_seed(opts.seed).with_len(len)
}
