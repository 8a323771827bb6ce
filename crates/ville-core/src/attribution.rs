#![forbid(unsafe_code)]

//! Post-hoc attribution of a detection to individual features.
//!
//! For each column, compare the `before` points preceding the detection
//! with the `after` points starting at it:
//!
//! ```text
//! mean_shift   = |μ_after − μ_before| / (σ_before + ε)
//! spread_shift = |σ_after − σ_before| / (σ_before + ε)
//! total        = mean_shift + spread_shift
//! share        = total / Σ total          (0 when Σ total = 0)
//! ```
//!
//! Attribution reads the table only; it never feeds back into detection.

use serde::Serialize;

use crate::config::AttributionConfig;
use crate::scorer::SCORE_EPSILON;
use crate::stats;
use crate::table::FeatureTable;

/// Shift measured for one feature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub mean_shift: f64,
    pub spread_shift: f64,
    pub total: f64,
    pub share: f64,
}

/// Features ranked by how much they moved around a detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribution {
    pub detection_index: usize,
    /// Sorted by `total`, largest first.
    pub contributions: Vec<FeatureContribution>,
}

impl Attribution {
    /// Largest contributor, if any feature was measured.
    pub fn top(&self) -> Option<&FeatureContribution> {
        self.contributions.first()
    }
}

/// Rank every column of `table` by its shift across `detection_index`.
///
/// Windows are clipped to the table. An empty before or after window
/// gives zero shift for every feature.
pub fn attribute(
    table: &FeatureTable,
    detection_index: usize,
    config: &AttributionConfig,
) -> Attribution {
    let rows = table.rows();
    let t = detection_index.min(rows);
    let before = t.saturating_sub(config.before)..t;
    let after = t..(t + config.after).min(rows);

    let mut contributions: Vec<FeatureContribution> = table
        .names()
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let column = table.column(j);
            let (mean_shift, spread_shift) = if before.is_empty() || after.is_empty() {
                (0.0, 0.0)
            } else {
                shift(&column[before.clone()], &column[after.clone()])
            };
            FeatureContribution {
                feature: name.clone(),
                mean_shift,
                spread_shift,
                total: mean_shift + spread_shift,
                share: 0.0,
            }
        })
        .collect();

    let sum: f64 = contributions.iter().map(|c| c.total).sum();
    if sum > 0.0 {
        for c in &mut contributions {
            c.share = c.total / sum;
        }
    }
    contributions.sort_by(|a, b| b.total.total_cmp(&a.total));

    Attribution {
        detection_index,
        contributions,
    }
}

fn shift(before: &[f64], after: &[f64]) -> (f64, f64) {
    let sd_before = stats::std_dev(before);
    let scale = sd_before + SCORE_EPSILON;
    let mean_shift = (stats::mean(after) - stats::mean(before)).abs() / scale;
    let spread_shift = (stats::std_dev(after) - sd_before).abs() / scale;
    (mean_shift, spread_shift)
}
