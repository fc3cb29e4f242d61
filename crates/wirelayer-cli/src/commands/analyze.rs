use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use wirelayer_core::config::AnalysisConfig;
use wirelayer_core::models::*;
use wirelayer_core::persist::Database;
use wirelayer_core::pipeline::{Pipeline, PipelineSummary};
use wirelayer_core::store::CaptureStore;
use wirelayer_core::views::{self, Alert, FlowSummary, ProtocolStat};

use crate::capture::CaptureFile;

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Path to the PCAP or PCAPNG file
    pub pcap: PathBuf,

    /// Rule file (JSON array); defaults to the built-in rule pack
    #[arg(short, long)]
    pub rules: Option<PathBuf>,

    /// Analysis config file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Export the analyzed session into this SQLite database
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Write extracted files into this directory
    #[arg(long)]
    pub extract: Option<PathBuf>,

    /// Print a JSON report on stdout instead of the console summary
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Worker threads (overrides the config file; 0 = one per core)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Lowest severity listed in the alert output
    #[arg(long, default_value = "low")]
    pub min_severity: Severity,

    /// Capture filter expression recorded on the session
    #[arg(long)]
    pub filter: Option<String>,
}

#[derive(Serialize)]
struct JsonReport {
    version: &'static str,
    capture: CaptureInfo,
    session: Session,
    summary: PipelineSummary,
    flows: Vec<FlowSummary>,
    protocols: Vec<ProtocolStat>,
    alerts: Vec<Alert>,
}

#[derive(Serialize)]
struct CaptureInfo {
    filename: String,
    sha256: String,
    size_bytes: u64,
    frames: usize,
    parse_errors: u64,
}

pub fn run(args: AnalyzeArgs) -> Result<()> {
    let started = Instant::now();

    let mut config = match &args.config {
        Some(path) => AnalysisConfig::from_file(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;

    let rules = match &args.rules {
        Some(path) => wirelayer_core::rules::load_rules(path)?,
        None => wirelayer_core::rules::default_rules()?,
    };

    // 1. Ingest
    let capture = CaptureFile::from_file(&args.pcap)
        .with_context(|| format!("failed to read {}", args.pcap.display()))?;
    let store = Arc::new(CaptureStore::new(config.flow_idle_timeout_secs));
    let session = store.open_session_with_link(capture.filename.clone(), args.filter.clone(), capture.link_type);

    let mut rejected = 0usize;
    for frame in capture.frames.iter().cloned() {
        if let Err(e) = store.ingest_frame(session, frame) {
            tracing::warn!(error = %e, "frame rejected");
            rejected += 1;
        }
    }
    let sess = store.close_session(session)?;

    if !args.json {
        println!(
            "  {} {}",
            console::style("[1/3] ingesting").cyan().bold(),
            args.pcap.display(),
        );
        println!(
            "        {} frames, {} out of order, {} rejected, {} parse errors, sha256:{}",
            console::style(sess.packet_count).green().bold(),
            sess.out_of_order_packets,
            rejected,
            capture.parse_errors,
            &capture.file_sha256[..16],
        );
    }

    // 2. Decode every layer and evaluate rules
    let pipeline = Pipeline::new(Arc::clone(&store), rules, config)?;
    let summary = pipeline.analyze_session(session)?;

    let flows = views::flow_summary(&store, session);
    let protocols = views::protocol_distribution(&store, session);
    let alerts = views::alerts(&store, session, args.min_severity);

    // 3. Outputs
    if let Some(dir) = &args.extract {
        let written = write_files(&store, session, dir)?;
        if !args.json {
            println!(
                "        {} files -> {}",
                console::style(written).green(),
                dir.display(),
            );
        }
    }

    if let Some(path) = &args.db {
        let db = Database::create(path)?;
        let definitions: Vec<Rule> = pipeline.rules().rules().iter().map(|r| r.rule().clone()).collect();
        let counts = db
            .export_session(&store, session, &definitions)
            .with_context(|| format!("failed to export to {}", path.display()))?;
        tracing::info!(db = %path.display(), matches = counts.matches, "session exported");
    }

    if args.json {
        let report = JsonReport {
            version: wirelayer_core::VERSION,
            capture: CaptureInfo {
                filename: capture.filename,
                sha256: capture.file_sha256,
                size_bytes: capture.file_size,
                frames: capture.frames.len(),
                parse_errors: capture.parse_errors,
            },
            session: sess,
            summary,
            flows,
            protocols,
            alerts,
        };
        println!("{}", serde_json::to_string_pretty(&report).context("failed to serialize report")?);
        return Ok(());
    }

    print_summary(&summary, &flows, &protocols);
    print_alerts(&alerts);

    if let Some(path) = &args.db {
        println!(
            "  {} {}",
            console::style("database ->").green().bold(),
            path.display(),
        );
    }
    println!(
        "  {} {:.1}ms",
        console::style("completed in").white().bold(),
        started.elapsed().as_secs_f64() * 1000.0,
    );
    Ok(())
}

fn print_summary(summary: &PipelineSummary, flows: &[FlowSummary], protocols: &[ProtocolStat]) {
    println!(
        "  {}",
        console::style("[2/3] decoding layers").cyan().bold(),
    );
    println!(
        "        transport: {} records ({} undecodable)",
        console::style(summary.transport_records).green(),
        summary.transport_errors,
    );
    println!(
        "        flows: {} ({} closed)",
        console::style(summary.flows).green(),
        flows.iter().filter(|f| f.state == "CLOSED").count(),
    );
    println!(
        "        encoding: {} records ({} unknown)",
        console::style(summary.encoding_records).green(),
        summary.unknown_encodings,
    );
    println!(
        "        content: {} records, {} files",
        console::style(summary.content_records).green(),
        console::style(summary.extracted_files).green(),
    );
    for stat in protocols {
        println!(
            "          {:<9} {:<8} {} packets, {} bytes",
            stat.layer,
            console::style(&stat.protocol).cyan(),
            stat.packets,
            stat.bytes,
        );
    }
    if summary.integrity_errors > 0 || summary.rule_failures > 0 {
        println!(
            "        {} {} integrity errors, {} rule failures",
            console::style("warning:").yellow().bold(),
            summary.integrity_errors,
            summary.rule_failures,
        );
    }
    if summary.aborted {
        println!(
            "        {} session aborted, results are partial",
            console::style("warning:").yellow().bold(),
        );
    }
}

fn print_alerts(alerts: &[Alert]) {
    println!(
        "  {}",
        console::style("[3/3] rule matches").cyan().bold(),
    );
    if alerts.is_empty() {
        println!("        no matches");
        return;
    }
    for alert in alerts.iter().take(20) {
        println!(
            "        {} {} {} -> {} {}",
            super::severity_style(alert.severity),
            console::style(&alert.rule_id).white().bold(),
            alert.src.as_deref().unwrap_or("-"),
            alert.dst.as_deref().unwrap_or("-"),
            console::style(&alert.matched_data).yellow(),
        );
    }
    if alerts.len() > 20 {
        println!("        ... and {} more", alerts.len() - 20);
    }
}

fn write_files(store: &CaptureStore, session: SessionId, dir: &std::path::Path) -> Result<usize> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create output dir {}", dir.display()))?;
    let files = store.files(session);
    for file in &files {
        let path = dir.join(&file.name);
        std::fs::write(&path, &file.data).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(files.len())
}
