#![forbid(unsafe_code)]

//! Calibration checks: p-value uniformity and Ville's inequality.
//!
//! # Kolmogorov–Smirnov
//!
//! ```text
//! D_n = sup_x |F_n(x) − x|,      F_n the empirical CDF of the p-values
//! reject uniformity at 5% when D_n > 1.358 / √n   (asymptotic)
//! ```
//!
//! # Ville false-alarm rate
//!
//! Feed i.i.d. Uniform(0, 1) p-values to a betting martingale and record
//! whether the wealth ever exceeds `1/α`. Ville's inequality bounds the
//! fraction of such runs by `α`; the report carries the Monte Carlo
//! standard error so callers can allow for simulation noise.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use ville_core::{BettingMartingale, Martingale, MartingaleKind, PipelineConfig};

/// Asymptotic 5% critical constant of the one-sample KS statistic.
pub const KS_CRITICAL_05: f64 = 1.358;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KsResult {
    pub n: usize,
    pub statistic: f64,
    pub critical_05: f64,
    pub passes: bool,
}

/// One-sample KS test of `p` against Uniform(0, 1).
pub fn ks_uniform(p: &[f64]) -> KsResult {
    let n = p.len();
    if n == 0 {
        return KsResult {
            n,
            statistic: 0.0,
            critical_05: f64::INFINITY,
            passes: true,
        };
    }
    let mut sorted = p.to_vec();
    sorted.sort_by(f64::total_cmp);
    let nf = n as f64;
    let statistic = sorted
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let x = x.clamp(0.0, 1.0);
            ((i + 1) as f64 / nf - x).max(x - i as f64 / nf)
        })
        .fold(0.0, f64::max);
    let critical_05 = KS_CRITICAL_05 / nf.sqrt();
    KsResult {
        n,
        statistic,
        critical_05,
        passes: statistic <= critical_05,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VilleReport {
    pub martingale: MartingaleKind,
    pub runs: usize,
    pub len: usize,
    pub alpha: f64,
    /// Runs whose wealth exceeded `1/alpha` at least once.
    pub alarms: usize,
    pub rate: f64,
    /// Binomial standard error of `rate` at the nominal `alpha`.
    pub std_error: f64,
    /// Largest wealth seen across all runs.
    pub max_wealth: f64,
}

impl VilleReport {
    /// `rate ≤ alpha + sigmas × std_error`.
    pub fn within_bound(&self, sigmas: f64) -> bool {
        self.rate <= self.alpha + sigmas * self.std_error
    }
}

/// Simulate `runs` null streams of `len` uniform p-values.
pub fn ville_false_alarm_rate(
    kind: MartingaleKind,
    runs: usize,
    len: usize,
    alpha: f64,
    seed: u64,
) -> VilleReport {
    let config = PipelineConfig::default().with_martingale(kind).with_alpha(alpha);
    let threshold = config.fixed_threshold();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut martingale = Martingale::from_config(&config);
    let mut alarms = 0usize;
    let mut max_wealth = 0.0f64;

    for _ in 0..runs {
        martingale.reset();
        let mut alarmed = false;
        for _ in 0..len {
            // (0, 1]: a literal zero would be floored anyway.
            let p = 1.0 - rng.gen_range(0.0..1.0);
            let w = martingale.update(p);
            max_wealth = max_wealth.max(w);
            alarmed |= w > threshold;
        }
        alarms += usize::from(alarmed);
    }

    let rate = if runs == 0 { 0.0 } else { alarms as f64 / runs as f64 };
    let std_error = if runs == 0 {
        0.0
    } else {
        (alpha * (1.0 - alpha) / runs as f64).sqrt()
    };
    tracing::debug!(
        martingale = kind.name(),
        runs,
        len,
        alarms,
        rate,
        "ville simulation complete"
    );
    VilleReport {
        martingale: kind,
        runs,
        len,
        alpha,
        alarms,
        rate,
        std_error,
        max_wealth,
    }
}
