use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use wirelayer_core::persist::Database;

#[derive(Args)]
pub struct ViewsArgs {
    /// SQLite database written by `analyze --db`
    pub db: PathBuf,

    /// High-severity alerts
    #[arg(long, default_value_t = false)]
    pub alerts: bool,

    /// Per-flow byte and packet totals
    #[arg(long, default_value_t = false)]
    pub flows: bool,

    /// Packet counts per protocol and layer
    #[arg(long, default_value_t = false)]
    pub protocols: bool,

    /// Output format
    #[arg(short, long, default_value = "table", value_parser = ["table", "json"])]
    pub format: String,
}

pub fn run(args: ViewsArgs) -> Result<()> {
    let db = Database::open(&args.db)?;
    let json = args.format == "json";
    let all = !(args.alerts || args.flows || args.protocols);

    if args.flows || all {
        let rows = db.flow_summary()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            println!("  {}", console::style("flows").cyan().bold());
            for row in &rows {
                println!(
                    "    {:<5} {} <-> {} {:<11} {} pkts {} bytes ({} / {}) {}ms",
                    row.protocol,
                    row.endpoint_a,
                    row.endpoint_b,
                    row.state,
                    row.packets,
                    row.total_bytes,
                    row.bytes_a_to_b,
                    row.bytes_b_to_a,
                    row.duration_ms,
                );
            }
        }
    }

    if args.protocols || all {
        let rows = db.protocol_distribution()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            println!("  {}", console::style("protocols").cyan().bold());
            for row in &rows {
                println!(
                    "    {:<9} {:<8} {} packets, {} bytes",
                    row.layer,
                    console::style(&row.protocol).cyan(),
                    row.packets,
                    row.bytes,
                );
            }
        }
    }

    if args.alerts || all {
        let rows = db.high_severity_alerts()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            println!("  {}", console::style("high severity alerts").cyan().bold());
            if rows.is_empty() {
                println!("    none");
            }
            for row in &rows {
                println!(
                    "    {} {} {} [{}] {} -> {} {}",
                    row.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    super::severity_style(row.severity),
                    console::style(&row.rule_id).white().bold(),
                    row.layer,
                    row.src.as_deref().unwrap_or("-"),
                    row.dst.as_deref().unwrap_or("-"),
                    console::style(&row.matched_data).yellow(),
                );
            }
        }
    }
    Ok(())
}
