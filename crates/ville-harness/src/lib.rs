#![forbid(unsafe_code)]

//! Synthetic-stream harness for `ville-core`.
//!
//! - **Scenarios**: deterministic stationary, shifted, and tie-heavy streams
//! - **Calibration**: KS uniformity of p-values and Ville false-alarm rates
//! - **Evidence**: JSONL ledger of every step, detection, and attribution
//!
//! # Quick Start
//!
//! ```sh
//! ville-harness --scenario=mean-shift --seed=7 > run.jsonl
//! VILLE_LOG=info ville-harness --scenario=ville --runs=1000 --no-steps
//! ```

pub mod calibration;
pub mod cli;
pub mod evidence;
pub mod runner;
pub mod scenario;

pub use calibration::{KsResult, VilleReport, ks_uniform, ville_false_alarm_rate};
pub use evidence::{EvidenceLedger, EvidenceRecord};
pub use runner::{HarnessError, RunSummary, run_scenario};
pub use scenario::{ScenarioConfig, StreamPattern};
