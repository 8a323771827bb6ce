#![forbid(unsafe_code)]

//! Betting martingales over conformal p-values.
//!
//! Both strategies turn a p-value stream into a wealth process that stays
//! bounded in expectation while p-values are Uniform(0, 1) and grows when
//! they are persistently small.
//!
//! # Power Martingale
//!
//! ```text
//! f_ε(p) = ε · p^(ε−1)              ∫₀¹ f_ε(p) dp = 1
//! M_t    = M_{t−1} · f_ε(p_t),      M_{−1} = 1
//! ```
//!
//! Smaller `ε` bets harder on tiny p-values.
//!
//! # Simple Jumper
//!
//! A mixture over three betting directions `ε ∈ {−1, 0, +1}` with
//! `f_ε(p) = 1 + ε·(p − ½)`. Each step:
//!
//! ```text
//! C'_ε = (1 − J)·C_ε + J·(Σ C)/3         Markov mixing toward uniform
//! C_ε  = C'_ε · f_ε(p)                   betting
//! M_t  = Σ C_ε
//! ```
//!
//! starting from `C = (⅓, ⅓, ⅓)`. Mixing lets capital jump to whichever
//! direction is currently winning, so no single `ε` has to be right.
//!
//! # Key Invariants
//!
//! 1. **Martingale**: `E[M_t | M_{t−1}] = M_{t−1}` under uniform p-values,
//!    hence `P(sup_t M_t ≥ 1/α) ≤ α` (Ville's inequality).
//! 2. **Positive wealth**: `M_t ∈ [WEALTH_MIN, WEALTH_MAX]` always.
//!
//! # Failure Modes
//!
//! | Condition | Behavior |
//! |-----------|----------|
//! | `M_t` overflow / underflow | clipped to `[WEALTH_MIN, WEALTH_MAX]` |
//! | p-value NaN | treated as `1.0` |
//! | p-value ≤ 0 or > 1 | clamped into `[P_FLOOR, 1]` |

use crate::config::{MartingaleKind, PipelineConfig};
use crate::pvalue::P_FLOOR;

/// Wealth floor. Prevents permanent zero-lock after a run of large p-values.
pub const WEALTH_MIN: f64 = 1e-10;

/// Wealth ceiling. Far above any detection threshold.
pub const WEALTH_MAX: f64 = 1e10;

/// Incremental betting strategy over a p-value stream.
pub trait BettingMartingale {
    /// Consume one p-value and return the new wealth.
    fn update(&mut self, p: f64) -> f64;

    /// Current wealth (`1.0` before the first update).
    fn wealth(&self) -> f64;

    /// Back to initial wealth.
    fn reset(&mut self);

    /// Wealth after each p-value in `p_values`.
    fn process(&mut self, p_values: &[f64]) -> Vec<f64> {
        p_values.iter().map(|&p| self.update(p)).collect()
    }
}

#[inline]
fn sanitize_p(p: f64) -> f64 {
    if p.is_nan() { 1.0 } else { p.clamp(P_FLOOR, 1.0) }
}

#[inline]
fn clip_wealth(w: f64) -> f64 {
    if w.is_nan() {
        WEALTH_MIN
    } else {
        w.clamp(WEALTH_MIN, WEALTH_MAX)
    }
}

// ─── Power ───────────────────────────────────────────────────────────────

/// Power martingale with fixed sensitivity `ε ∈ (0, 1)`.
#[derive(Debug, Clone)]
pub struct PowerMartingale {
    epsilon: f64,
    wealth: f64,
}

impl PowerMartingale {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            wealth: 1.0,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Per-step multiplier `ε · p^(ε−1)`.
    #[inline]
    pub fn betting_factor(&self, p: f64) -> f64 {
        self.epsilon * sanitize_p(p).powf(self.epsilon - 1.0)
    }
}

impl BettingMartingale for PowerMartingale {
    fn update(&mut self, p: f64) -> f64 {
        self.wealth = clip_wealth(self.wealth * self.betting_factor(p));
        self.wealth
    }

    fn wealth(&self) -> f64 {
        self.wealth
    }

    fn reset(&mut self) {
        self.wealth = 1.0;
    }
}

/// Power martingale as a whole-array cumulative product, computed in log
/// space: `M_t = exp(Σ_{s≤t} ln f_ε(p_s))`, clipped per element.
///
/// The running log wealth is clamped to `[ln WEALTH_MIN, ln WEALTH_MAX]` at
/// every step, so after touching a bound the product restarts from the bound
/// exactly as the incremental update does. Matches
/// [`PowerMartingale::process`] elementwise up to rounding.
pub fn power_martingale_cumprod(p_values: &[f64], epsilon: f64) -> Vec<f64> {
    let ln_eps = epsilon.ln();
    let (ln_min, ln_max) = (WEALTH_MIN.ln(), WEALTH_MAX.ln());
    let mut log_wealth = 0.0;
    p_values
        .iter()
        .map(|&p| {
            let step = ln_eps + (epsilon - 1.0) * sanitize_p(p).ln();
            log_wealth = (log_wealth + step).clamp(ln_min, ln_max);
            clip_wealth(log_wealth.exp())
        })
        .collect()
}

// ─── Simple Jumper ───────────────────────────────────────────────────────

/// Betting directions of the three Simple Jumper regimes.
pub const JUMPER_DIRECTIONS: [f64; 3] = [-1.0, 0.0, 1.0];

/// Simple Jumper martingale with jump probability `J`.
#[derive(Debug, Clone)]
pub struct SimpleJumper {
    jump: f64,
    capital: [f64; 3],
}

impl SimpleJumper {
    pub fn new(jump: f64) -> Self {
        Self {
            jump,
            capital: [1.0 / 3.0; 3],
        }
    }

    pub fn jump_prob(&self) -> f64 {
        self.jump
    }

    /// Capital per regime, ordered `ε = −1, 0, +1`.
    pub fn capital(&self) -> [f64; 3] {
        self.capital
    }
}

impl BettingMartingale for SimpleJumper {
    fn update(&mut self, p: f64) -> f64 {
        let p = sanitize_p(p);
        let total: f64 = self.capital.iter().sum();
        let share = self.jump * total / 3.0;
        for (c, eps) in self.capital.iter_mut().zip(JUMPER_DIRECTIONS) {
            *c = ((1.0 - self.jump) * *c + share) * (1.0 + eps * (p - 0.5));
        }
        let wealth: f64 = self.capital.iter().sum();
        let clipped = clip_wealth(wealth);
        if clipped != wealth && wealth > 0.0 && wealth.is_finite() {
            let scale = clipped / wealth;
            for c in &mut self.capital {
                *c *= scale;
            }
        } else if !(wealth > 0.0 && wealth.is_finite()) {
            self.capital = [clipped / 3.0; 3];
        }
        clipped
    }

    fn wealth(&self) -> f64 {
        self.capital.iter().sum()
    }

    fn reset(&mut self) {
        self.capital = [1.0 / 3.0; 3];
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────

/// Martingale resolved from a [`MartingaleKind`].
#[derive(Debug, Clone)]
pub enum Martingale {
    Power(PowerMartingale),
    SimpleJumper(SimpleJumper),
}

impl Martingale {
    pub fn from_config(config: &PipelineConfig) -> Self {
        match config.martingale {
            MartingaleKind::Power => Self::Power(PowerMartingale::new(config.epsilon)),
            MartingaleKind::SimpleJumper => Self::SimpleJumper(SimpleJumper::new(config.jump_prob)),
        }
    }

    pub fn kind(&self) -> MartingaleKind {
        match self {
            Self::Power(_) => MartingaleKind::Power,
            Self::SimpleJumper(_) => MartingaleKind::SimpleJumper,
        }
    }
}

impl BettingMartingale for Martingale {
    #[inline]
    fn update(&mut self, p: f64) -> f64 {
        match self {
            Self::Power(m) => m.update(p),
            Self::SimpleJumper(m) => m.update(p),
        }
    }

    fn wealth(&self) -> f64 {
        match self {
            Self::Power(m) => m.wealth(),
            Self::SimpleJumper(m) => m.wealth(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Power(m) => m.reset(),
            Self::SimpleJumper(m) => m.reset(),
        }
    }
}
