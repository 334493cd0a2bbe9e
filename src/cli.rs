use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::warn;

use smtpscout::config::Config;
use smtpscout::engine::{
    JsonlSink, LogSink, NullObserver, PacketSource, PcapFileSource, Pipeline, ResultSink,
    RunReport,
};
use smtpscout::signatures::{MatchingSession, SignatureCompiler, SignatureMatcher};

#[derive(Parser)]
#[command(name = "smtpscout")]
#[command(author, version, about = "SMTP bot detection from captured traffic")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay capture files and match sessions against signatures
    Run {
        /// PCAP files to process, after any configured ones
        #[arg(value_name = "PCAP")]
        files: Vec<PathBuf>,

        /// Signature files, after any configured ones
        #[arg(short, long)]
        signatures: Vec<PathBuf>,

        /// Write matched sessions as JSON lines to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Treat message fragments as separate messages
        #[arg(long)]
        no_reassembly: bool,
    },

    /// Compile signature files and report what they contain
    CheckSignatures {
        /// Signature files to compile
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Macro file loaded before the signature files
        #[arg(short, long)]
        macros: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    GenConfig,
}

/// Table row for the end-of-run counters
#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: u64,
}

/// Table row for per-client match totals
#[derive(Tabled)]
struct ClientRow {
    #[tabled(rename = "Client")]
    client: String,
    #[tabled(rename = "Sessions")]
    sessions: u64,
    #[tabled(rename = "Signatures")]
    signatures: String,
}

/// Table row for compiled signatures
#[derive(Tabled)]
struct SignatureRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Statements")]
    statements: usize,
    #[tabled(rename = "TCP flags")]
    tcp_flags: String,
}

/// Keeps matched sessions for the summary tables while forwarding
/// them to the configured sink.
struct CollectingSink {
    inner: Box<dyn ResultSink>,
    matched: Vec<MatchingSession>,
}

impl ResultSink for CollectingSink {
    fn record(&mut self, matched: &MatchingSession) -> Result<()> {
        self.inner.record(matched)?;
        self.matched.push(matched.clone());
        Ok(())
    }

    fn finish(&mut self, report: &RunReport) -> Result<()> {
        self.inner.finish(report)
    }
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Run {
            files,
            signatures,
            output,
            no_reassembly,
        } => {
            run_capture(config, files, signatures, output, no_reassembly).await?;
        }

        Commands::CheckSignatures { files, macros } => {
            check_signatures(files, macros)?;
        }

        Commands::GenConfig => {
            print!("{}", Config::default().to_toml()?);
        }
    }

    Ok(())
}

async fn run_capture(
    config: Config,
    files: Vec<PathBuf>,
    signature_files: Vec<PathBuf>,
    output: Option<PathBuf>,
    no_reassembly: bool,
) -> Result<()> {
    let mut capture_files = config.capture.files.clone();
    capture_files.extend(files);
    if capture_files.is_empty() {
        anyhow::bail!("no capture files given on the command line or in the configuration");
    }

    let mut compiler = SignatureCompiler::new();
    if let Some(macro_file) = &config.signatures.macro_file {
        compiler.load_macro_file(macro_file)?;
    }
    let mut matcher = SignatureMatcher::new();
    for file in config.signatures.files.iter().chain(signature_files.iter()) {
        for signature in compiler.compile_file(file)? {
            matcher.add_signature(signature);
        }
    }
    if matcher.is_empty() {
        warn!("no signatures loaded, nothing will match");
    }

    let mut sources: Vec<Box<dyn PacketSource>> = Vec::with_capacity(capture_files.len());
    for file in &capture_files {
        sources.push(Box::new(PcapFileSource::open(file)?));
    }

    let results_path = output.or_else(|| config.output.results.clone());
    let inner: Box<dyn ResultSink> = match &results_path {
        Some(path) => Box::new(JsonlSink::create(path)?),
        None => Box::new(LogSink),
    };
    let mut sink = CollectingSink {
        inner,
        matched: Vec::new(),
    };

    let reassemble = config.smtp.reassemble_messages && !no_reassembly;
    let pipeline = Pipeline::new(
        config.tcp.clone(),
        reassemble,
        config.tcp.channel_capacity,
        matcher,
    );
    let report = pipeline
        .run(sources, &mut sink, &mut NullObserver)
        .await
        .context("processing capture files")?;

    print_report(&report);
    print_clients(&pipeline, &sink.matched);
    if let Some(path) = &results_path {
        println!(
            "\n{} {}",
            "Matched sessions written to".green().bold(),
            path.display()
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", "=== Run Summary ===".bold());
    let rows = vec![
        MetricRow { metric: "TCP packets", value: report.tcp_packets },
        MetricRow { metric: "TCP sessions", value: report.tcp_sessions },
        MetricRow { metric: "SMTP packets", value: report.smtp_packets },
        MetricRow { metric: "SMTP sessions", value: report.smtp_sessions },
        MetricRow { metric: "Matched sessions", value: report.matched_sessions },
        MetricRow { metric: "Discarded packets", value: report.discarded.total },
        MetricRow { metric: "  retransmitted", value: report.discarded.retransmitted },
        MetricRow { metric: "  evicted pending", value: report.discarded.evicted_pending },
        MetricRow { metric: "  malformed frames", value: report.discarded.malformed },
    ];
    println!("{}", Table::new(rows));
}

fn print_clients(pipeline: &Pipeline, matched: &[MatchingSession]) {
    if matched.is_empty() {
        println!("\n{}", "No sessions matched any signature".yellow().bold());
        return;
    }
    let sessions: Vec<_> = matched.iter().map(|m| &m.session).collect();
    let clients = pipeline
        .matcher()
        .read()
        .matched_clients(sessions.iter().copied());

    println!("\n{}", "=== Matched Clients ===".bold());
    let rows: Vec<ClientRow> = clients
        .iter()
        .map(|client| ClientRow {
            client: client.client.to_string(),
            sessions: client.sessions,
            signatures: client
                .matches
                .iter()
                .map(|(name, count)| format!("{} ({})", name, count))
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();
    println!("{}", Table::new(rows));
}

fn check_signatures(files: Vec<PathBuf>, macros: Option<PathBuf>) -> Result<()> {
    let mut compiler = SignatureCompiler::new();
    if let Some(macro_file) = &macros {
        compiler.load_macro_file(macro_file)?;
    }

    let mut rows = Vec::new();
    for file in &files {
        let signatures = compiler.compile_file(file)?;
        println!(
            "{} {} ({} signatures)",
            "Compiled".green().bold(),
            file.display(),
            signatures.len()
        );
        for signature in signatures {
            rows.push(SignatureRow {
                name: signature.name().to_string(),
                statements: signature.statements().len(),
                tcp_flags: signature_flags(&signature),
            });
        }
    }
    if !rows.is_empty() {
        println!("{}", Table::new(rows));
    }
    Ok(())
}

fn signature_flags(signature: &smtpscout::signatures::Signature) -> String {
    if !signature.checks_tcp_flags() {
        return "-".to_string();
    }
    let mut flags = Vec::new();
    if signature.requires_syn() {
        flags.push("SYN");
    }
    if signature.requires_fin() {
        flags.push("FIN");
    }
    if signature.requires_rst() {
        flags.push("RST");
    }
    if flags.is_empty() {
        flags.push("none");
    }
    flags.join("+")
}
