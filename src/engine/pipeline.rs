//! Processing pipeline
//!
//! Drives each packet source through three sequential stages:
//! 1. Session reassembly - decoded segments become TCP sessions
//! 2. Dialogue reconstruction - each session is parsed as SMTP
//! 3. Signature matching - dialogues are checked against the rule set
//!
//! Capture and reassembly run on a blocking task, one session table
//! per source file; parsing and matching run on the async side,
//! connected by a bounded channel. Each source is followed by an
//! empty sentinel session so the consumer can observe file
//! boundaries.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::TcpConfig;
use crate::engine::capture::PacketSource;
use crate::engine::report::RunReport;
use crate::engine::sink::{ResultSink, SignatureObserver};
use crate::signatures::SignatureMatcher;
use crate::smtp::SmtpParser;
use crate::tcp::builder::{BuilderStats, SessionBuilder};
use crate::tcp::session::TcpSession;

/// Ties the reassembly, parsing and matching stages together.
pub struct Pipeline {
    tcp_config: TcpConfig,
    reassemble: bool,
    channel_capacity: usize,
    matcher: Arc<RwLock<SignatureMatcher>>,
}

impl Pipeline {
    pub fn new(
        tcp_config: TcpConfig,
        reassemble: bool,
        channel_capacity: usize,
        matcher: SignatureMatcher,
    ) -> Self {
        Self {
            tcp_config,
            reassemble,
            channel_capacity,
            matcher: Arc::new(RwLock::new(matcher)),
        }
    }

    /// Shared handle to the live rule set. Signatures added through
    /// this handle apply to sessions not yet matched.
    pub fn matcher(&self) -> Arc<RwLock<SignatureMatcher>> {
        Arc::clone(&self.matcher)
    }

    /// Process every source to exhaustion and report the totals.
    pub async fn run(
        &self,
        sources: Vec<Box<dyn PacketSource>>,
        sink: &mut dyn ResultSink,
        observer: &mut dyn SignatureObserver,
    ) -> anyhow::Result<RunReport> {
        let (tx, mut rx) = mpsc::channel::<TcpSession>(self.channel_capacity);
        let tcp_config = self.tcp_config.clone();

        let producer = task::spawn_blocking(move || {
            let mut stats = BuilderStats::default();
            let mut malformed = 0u64;
            for mut source in sources {
                let mut builder = SessionBuilder::new(tcp_config.clone());
                while let Some(packet) = source.next_packet()? {
                    for session in builder.add_packet(packet) {
                        tx.blocking_send(session)
                            .map_err(|_| anyhow::anyhow!("session consumer stopped"))?;
                    }
                }
                for session in builder.finish() {
                    tx.blocking_send(session)
                        .map_err(|_| anyhow::anyhow!("session consumer stopped"))?;
                }
                debug!(
                    packets = builder.stats().tcp_packets,
                    sessions = builder.stats().tcp_sessions,
                    skipped = source.malformed(),
                    "capture source drained"
                );
                stats.absorb(builder.stats());
                malformed += source.malformed();
                source.close();
                // file boundary marker
                tx.blocking_send(TcpSession::new())
                    .map_err(|_| anyhow::anyhow!("session consumer stopped"))?;
            }
            Ok::<_, anyhow::Error>((stats, malformed))
        });

        let mut parser = SmtpParser::new(self.reassemble);
        let mut matched_sessions = 0u64;

        while let Some(session) = rx.recv().await {
            if session.is_empty() {
                debug!("source exhausted");
                continue;
            }
            if self.process(&mut parser, &session, sink, observer)? {
                matched_sessions += 1;
            }
        }

        let (builder_stats, malformed) = producer.await.context("reassembly task")??;
        let parser_stats = parser.stats();

        let mut discarded = builder_stats.discarded;
        discarded.malformed = malformed;
        discarded.total += malformed;

        let report = RunReport {
            tcp_packets: builder_stats.tcp_packets,
            tcp_sessions: builder_stats.tcp_sessions,
            smtp_packets: parser_stats.smtp_packets,
            smtp_sessions: parser_stats.smtp_sessions,
            matched_sessions,
            discarded,
        };
        sink.finish(&report)?;
        Ok(report)
    }

    /// Parse one TCP session and match its dialogue; returns whether
    /// the session matched and was recorded. A session that fails to
    /// reconstruct is dropped from the match stream, not fatal.
    fn process(
        &self,
        parser: &mut SmtpParser,
        session: &TcpSession,
        sink: &mut dyn ResultSink,
        observer: &mut dyn SignatureObserver,
    ) -> anyhow::Result<bool> {
        let smtp = match parser.parse(session) {
            Ok(Some(smtp)) => smtp,
            Ok(None) => return Ok(false),
            Err(err) => {
                warn!(%session, %err, "session dropped from match stream");
                return Ok(false);
            }
        };
        let hit = self.matcher.read().matching_session(&smtp);
        match hit {
            Some(matching) => {
                sink.record(&matching)?;
                Ok(true)
            }
            None => {
                observer.add_sample(&smtp);
                for signature in observer.drain_signatures() {
                    info!(name = %signature.name(), "adopting proposed signature");
                    self.matcher.write().add_signature(signature);
                }
                Ok(false)
            }
        }
    }
}
