use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use wirelayer_core::config::AnalysisConfig;
use wirelayer_core::rules::{RuleEngine, RuleHealth};

#[derive(Args)]
pub struct RulesArgs {
    /// Rule file (JSON array); defaults to the built-in rule pack
    pub file: Option<PathBuf>,

    /// Print the health report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn run(args: RulesArgs) -> Result<()> {
    let rules = match &args.file {
        Some(path) => wirelayer_core::rules::load_rules(path)?,
        None => wirelayer_core::rules::default_rules()?,
    };
    let engine = RuleEngine::new(rules, &AnalysisConfig::default());
    let report = engine.health();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for status in &report {
        let health = match &status.health {
            RuleHealth::Healthy => console::style("healthy".to_string()).green(),
            RuleHealth::Unhealthy(reason) => console::style(format!("unhealthy: {}", reason)).red().bold(),
        };
        let enabled = if status.enabled { "" } else { " (disabled)" };
        println!(
            "  {:<24} {:<9} {}{}",
            console::style(&status.id).cyan(),
            status.target_layer,
            health,
            console::style(enabled).dim(),
        );
    }

    let broken = report
        .iter()
        .filter(|s| matches!(s.health, RuleHealth::Unhealthy(_)))
        .count();
    println!(
        "\n  {} {} rules, {} unhealthy",
        console::style("summary:").white().bold(),
        report.len(),
        broken,
    );
    if broken > 0 {
        anyhow::bail!("{} rule(s) failed to compile", broken);
    }
    Ok(())
}
