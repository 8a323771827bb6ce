#![forbid(unsafe_code)]

//! JSONL evidence ledger.
//!
//! Every line is one self-contained JSON object sharing a small envelope
//! (`schema`, `run_id`, `seq`) followed by an `event`-tagged body.
//!
//! # JSONL Schema
//!
//! ```json
//! {"schema":"ville-evidence-v1","run_id":"mean_shift-42","seq":0,"event":"config","config":{...}}
//! {"schema":"ville-evidence-v1","run_id":"mean_shift-42","seq":1,"event":"step","stream":"value","index":0,"score":0.0,"p_det":1.0,"p_rnd":1.0,"wealth":0.92,"threshold":null,"crossing":false,"detected":false}
//! {"schema":"ville-evidence-v1","run_id":"mean_shift-42","seq":401,"event":"detection","stream":"value","start":203,"end":215}
//! {"schema":"ville-evidence-v1","run_id":"mean_shift-42","seq":402,"event":"attribution","attribution":{...}}
//! {"schema":"ville-evidence-v1","run_id":"stationary-42","seq":1001,"event":"uniformity","stream":"value","ks":{"n":1000,"statistic":0.021,"critical_05":0.043,"passes":true}}
//! {"schema":"ville-evidence-v1","run_id":"ville-42","seq":1,"event":"ville","report":{"martingale":"power","runs":500,...}}
//! {"schema":"ville-evidence-v1","run_id":"mean_shift-42","seq":403,"event":"summary","stream":"value","len":400,"detections":13,"first_detection":203,"max_wealth":1.2e6}
//! ```

use std::io::{self, Write};

use serde::Serialize;
use ville_core::{Attribution, PipelineConfig, PipelineOutput};

use crate::calibration::{KsResult, VilleReport};

/// Schema tag written on every line.
pub const EVIDENCE_SCHEMA: &str = "ville-evidence-v1";

/// Body of one ledger line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EvidenceRecord<'a> {
    Config {
        config: &'a PipelineConfig,
    },
    Step {
        stream: &'a str,
        index: usize,
        score: f64,
        p_det: f64,
        p_rnd: f64,
        wealth: f64,
        threshold: Option<f64>,
        crossing: bool,
        detected: bool,
    },
    Detection {
        stream: &'a str,
        start: usize,
        end: usize,
    },
    Attribution {
        attribution: &'a Attribution,
    },
    /// Uniformity check of a stream's randomized p-values.
    Uniformity {
        stream: &'a str,
        ks: KsResult,
    },
    /// Null false-alarm simulation.
    Ville {
        report: &'a VilleReport,
    },
    Summary {
        stream: &'a str,
        len: usize,
        detections: usize,
        first_detection: Option<usize>,
        max_wealth: f64,
    },
}

#[derive(Serialize)]
struct Envelope<'a> {
    schema: &'static str,
    run_id: &'a str,
    seq: u64,
    #[serde(flatten)]
    record: &'a EvidenceRecord<'a>,
}

/// Append-only JSONL writer.
#[derive(Debug)]
pub struct EvidenceLedger<W: Write> {
    writer: W,
    run_id: String,
    seq: u64,
    /// Include one `step` line per index.
    steps: bool,
}

impl<W: Write> EvidenceLedger<W> {
    pub fn new(writer: W, run_id: impl Into<String>) -> Self {
        Self {
            writer,
            run_id: run_id.into(),
            seq: 0,
            steps: true,
        }
    }

    /// Skip per-index `step` lines (detections and summaries only).
    #[must_use]
    pub fn without_steps(mut self) -> Self {
        self.steps = false;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Lines written so far.
    pub fn len(&self) -> u64 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }

    pub fn record(&mut self, record: &EvidenceRecord<'_>) -> io::Result<()> {
        let envelope = Envelope {
            schema: EVIDENCE_SCHEMA,
            run_id: &self.run_id,
            seq: self.seq,
            record,
        };
        serde_json::to_writer(&mut self.writer, &envelope)?;
        self.writer.write_all(b"\n")?;
        self.seq += 1;
        Ok(())
    }

    pub fn record_config(&mut self, config: &PipelineConfig) -> io::Result<()> {
        self.record(&EvidenceRecord::Config { config })
    }

    pub fn record_attribution(&mut self, attribution: &Attribution) -> io::Result<()> {
        self.record(&EvidenceRecord::Attribution { attribution })
    }

    /// Steps (unless disabled), one line per confirmed run, and a summary.
    pub fn record_output(&mut self, stream: &str, output: &PipelineOutput) -> io::Result<()> {
        if self.steps {
            let diagnostics = &output.report.diagnostics;
            for index in 0..output.len() {
                self.record(&EvidenceRecord::Step {
                    stream,
                    index,
                    score: output.scores[index],
                    p_det: output.p_det[index],
                    p_rnd: output.p_rnd[index],
                    wealth: output.martingale[index],
                    threshold: diagnostics.thresholds[index],
                    crossing: diagnostics.crossings[index],
                    detected: output.detections[index],
                })?;
            }
        }
        for run in &output.report.diagnostics.confirmed_runs {
            self.record(&EvidenceRecord::Detection {
                stream,
                start: run.start,
                end: run.end,
            })?;
        }
        self.record(&EvidenceRecord::Summary {
            stream,
            len: output.len(),
            detections: output.detections.iter().filter(|&&d| d).count(),
            first_detection: output.first_detection(),
            max_wealth: output.max_wealth(),
        })
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
