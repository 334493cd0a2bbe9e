//! Result sinks
//!
//! Matched dialogues leave the pipeline through a `ResultSink`;
//! unmatched ones are offered to a `SignatureObserver`, which may
//! propose new signatures for the matcher to pick up mid-run.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::engine::report::RunReport;
use crate::signatures::{MatchingSession, Signature};
use crate::smtp::SmtpSession;

/// Receives every matched dialogue and the end-of-run report.
pub trait ResultSink: Send {
    fn record(&mut self, matched: &MatchingSession) -> anyhow::Result<()>;

    /// Called once after the last session, with the final counters.
    fn finish(&mut self, report: &RunReport) -> anyhow::Result<()>;
}

/// Writes one JSON document per matched dialogue, the report last.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("creating results file {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }
}

impl ResultSink for JsonlSink {
    fn record(&mut self, matched: &MatchingSession) -> anyhow::Result<()> {
        let line = serde_json::to_string(matched).context("serializing matched session")?;
        writeln!(self.writer, "{}", line)
            .with_context(|| format!("writing to {}", self.path.display()))?;
        Ok(())
    }

    fn finish(&mut self, _report: &RunReport) -> anyhow::Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("flushing {}", self.path.display()))?;
        Ok(())
    }
}

/// Logs each match instead of persisting it.
#[derive(Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn record(&mut self, matched: &MatchingSession) -> anyhow::Result<()> {
        info!(
            client = %matched.session.client().0,
            signatures = ?matched.signatures,
            "matched session"
        );
        Ok(())
    }

    fn finish(&mut self, report: &RunReport) -> anyhow::Result<()> {
        info!(
            tcp_sessions = report.tcp_sessions,
            smtp_sessions = report.smtp_sessions,
            matched = report.matched_sessions,
            "run complete"
        );
        Ok(())
    }
}

/// Observes unmatched dialogues and may propose signatures for them.
///
/// The pipeline drains proposals after every sample and adds them to
/// the live matcher, so a proposal starts matching the very next
/// session.
pub trait SignatureObserver: Send {
    fn add_sample(&mut self, session: &SmtpSession);

    fn drain_signatures(&mut self) -> Vec<Signature>;
}

/// Observer that proposes nothing.
#[derive(Debug, Default)]
pub struct NullObserver;

impl SignatureObserver for NullObserver {
    fn add_sample(&mut self, _session: &SmtpSession) {}

    fn drain_signatures(&mut self) -> Vec<Signature> {
        Vec::new()
    }
}
