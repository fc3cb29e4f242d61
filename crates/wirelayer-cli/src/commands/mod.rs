pub mod analyze;
pub mod rules;
pub mod views;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "wirelayer",
    about = "Layered packet analysis: transport, encoding and content records with rule matching",
    long_about = "wirelayer - decodes captured traffic into transport, encoding and content\n\
                  records, reconstructs flows, extracts files and evaluates layer-scoped rules.",
    version,
    propagate_version = true,
    styles = get_styles(),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Analyze a PCAP/PCAPNG file: ingest, decode every layer, run rules
    Analyze(analyze::AnalyzeArgs),

    /// Load a rule file and report the health of every rule
    Rules(rules::RulesArgs),

    /// Query the aggregate views of an exported database
    Views(views::ViewsArgs),
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Analyze(args) => analyze::run(args),
        Commands::Rules(args) => rules::run(args),
        Commands::Views(args) => views::run(args),
    }
}

/// Colored severity label for terminal output.
pub(crate) fn severity_style(severity: wirelayer_core::models::Severity) -> console::StyledObject<String> {
    use wirelayer_core::models::Severity;
    let label = severity.to_string();
    match severity {
        Severity::Critical => console::style(label).red().bold(),
        Severity::High => console::style(label).red(),
        Severity::Medium => console::style(label).yellow(),
        Severity::Low => console::style(label).cyan(),
    }
}

fn get_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(
            clap::builder::styling::AnsiColor::BrightCyan
                .on_default()
                .bold(),
        )
        .usage(
            clap::builder::styling::AnsiColor::BrightCyan
                .on_default()
                .bold(),
        )
        .literal(
            clap::builder::styling::AnsiColor::BrightGreen
                .on_default()
                .bold(),
        )
        .placeholder(
            clap::builder::styling::AnsiColor::BrightWhite
                .on_default()
                .dimmed(),
        )
}
