#![forbid(unsafe_code)]

//! Command-line argument parsing for the harness binary.
//!
//! Parses args manually to keep the binary lean. Supports environment
//! variable overrides via the `VILLE_*` prefix; flags win over env.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_TEXT: &str = "\
ville-harness: conformal martingale change detection on synthetic streams

USAGE:
    ville-harness [OPTIONS]

OPTIONS:
    --scenario=NAME      Scenario to run (default: mean-shift)
    --seed=N             Seed for data and tie breaking (default: 42)
    --config=PATH        Pipeline configuration JSON (default: built-in)
    --runs=N             Simulated runs for the ville scenario (default: 500)
    --len=N              Stream length (default: 400, ville: 1000)
    --out=PATH           Write the JSONL ledger here instead of stdout
    --no-steps           Omit per-index step records
    --help, -h           Show this help message
    --version, -V        Show version

SCENARIOS:
    stationary       i.i.d. N(0,1); p-values checked for uniformity
    mean-shift       N(0,1) then N(5,1) at the midpoint
    variance-shift   N(0,1) then N(0,16) at the midpoint
    ties             integer levels 0..3, heavy exact ties
    multivariate     3 features, one shifted; per-feature attribution
    ville            null false-alarm rate for both betting strategies

ENVIRONMENT VARIABLES:
    VILLE_SCENARIO       Override --scenario
    VILLE_SEED           Override --seed
    VILLE_LOG            tracing filter for stderr logs (default: warn)";

/// Named harness scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Stationary,
    MeanShift,
    VarianceShift,
    Ties,
    Multivariate,
    Ville,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Self::Stationary,
        Self::MeanShift,
        Self::VarianceShift,
        Self::Ties,
        Self::Multivariate,
        Self::Ville,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Stationary => "stationary",
            Self::MeanShift => "mean-shift",
            Self::VarianceShift => "variance-shift",
            Self::Ties => "ties",
            Self::Multivariate => "multivariate",
            Self::Ville => "ville",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| format!("unknown scenario: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Opts {
    pub scenario: Scenario,
    pub seed: u64,
    pub config: Option<PathBuf>,
    pub runs: usize,
    pub len: Option<usize>,
    pub out: Option<PathBuf>,
    pub steps: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            scenario: Scenario::MeanShift,
            seed: 42,
            config: None,
            runs: 500,
            len: None,
            out: None,
            steps: true,
        }
    }
}

/// What the binary should do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Version,
    Run(Opts),
}

impl Opts {
    /// Apply `VILLE_*` env overrides, then `args` (without the program name).
    pub fn parse_from<I>(
        args: I,
        env_lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Command, String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut opts = Self::default();

        if let Some(val) = env_lookup("VILLE_SCENARIO") {
            opts.scenario = val.parse()?;
        }
        if let Some(val) = env_lookup("VILLE_SEED")
            && let Ok(n) = val.parse()
        {
            opts.seed = n;
        }

        for arg in args {
            match arg.as_str() {
                "--help" | "-h" => return Ok(Command::Help),
                "--version" | "-V" => return Ok(Command::Version),
                "--no-steps" => opts.steps = false,
                other => {
                    if let Some(val) = other.strip_prefix("--scenario=") {
                        opts.scenario = val.parse()?;
                    } else if let Some(val) = other.strip_prefix("--seed=") {
                        opts.seed = parse_number(val, "--seed")?;
                    } else if let Some(val) = other.strip_prefix("--config=") {
                        opts.config = Some(PathBuf::from(val));
                    } else if let Some(val) = other.strip_prefix("--runs=") {
                        opts.runs = parse_number(val, "--runs")?;
                    } else if let Some(val) = other.strip_prefix("--len=") {
                        opts.len = Some(parse_number(val, "--len")?);
                    } else if let Some(val) = other.strip_prefix("--out=") {
                        opts.out = Some(PathBuf::from(val));
                    } else {
                        return Err(format!("unknown argument: {other}"));
                    }
                }
            }
        }
        Ok(Command::Run(opts))
    }

    /// Parse the process arguments and environment.
    pub fn parse() -> Result<Command, String> {
        Self::parse_from(env::args().skip(1), |key| env::var(key).ok())
    }
}

fn parse_number<T: FromStr>(val: &str, flag: &str) -> Result<T, String> {
    val.parse().map_err(|_| format!("invalid {flag} value: {val}"))
}
