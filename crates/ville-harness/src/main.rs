#![forbid(unsafe_code)]

//! `ville-harness` binary: run one scenario and emit its JSONL ledger.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use ville_core::PipelineConfig;
use ville_harness::cli::{Command, HELP_TEXT, Opts, VERSION};
use ville_harness::{EvidenceLedger, run_scenario};

fn init_logging() {
    let filter = EnvFilter::try_from_env("VILLE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(opts: &Opts) -> Result<PipelineConfig, String> {
    let Some(path) = &opts.config else {
        return Ok(PipelineConfig::default());
    };
    let doc = fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    PipelineConfig::from_json_str(&doc).map_err(|e| format!("{}: {e}", path.display()))
}

fn run(opts: &Opts) -> Result<bool, String> {
    let config = load_config(opts)?;
    let writer: Box<dyn Write> = match &opts.out {
        Some(path) => Box::new(
            File::create(path).map_err(|e| format!("cannot create {}: {e}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let run_id = format!("{}-{}", opts.scenario.name(), opts.seed);
    let mut ledger = EvidenceLedger::new(BufWriter::new(writer), run_id);
    if !opts.steps {
        ledger = ledger.without_steps();
    }
    let summary = run_scenario(opts, &config, &mut ledger).map_err(|e| e.to_string())?;
    for (stream, first) in &summary.first_detections {
        match first {
            Some(index) => eprintln!("{stream}: first detection at {index}"),
            None => eprintln!("{stream}: no detection"),
        }
    }
    Ok(summary.checks_passed)
}

fn main() -> ExitCode {
    let opts = match Opts::parse() {
        Ok(Command::Run(opts)) => opts,
        Ok(Command::Help) => {
            println!("{HELP_TEXT}");
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!("ville-harness {VERSION}");
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("{msg}\n\nRun with --help for usage.");
            return ExitCode::from(2);
        }
    };
    init_logging();

    match run(&opts) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("{}: checks failed", opts.scenario);
            ExitCode::FAILURE
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(2)
        }
    }
}
