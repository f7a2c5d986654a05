//! Status command.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::output::{display_option, print_single, OutputFormat};

use super::{CommandContext, NO_QUERY};

/// Show tunnel health.
#[derive(Debug, Args)]
pub struct StatusCommand {}

#[derive(Debug, Serialize, Deserialize)]
struct TunnelStatus {
    tunnel_id: String,
    state: String,
    uptime_secs: Option<u64>,
    restart_count: u64,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    active_routes: usize,
}

impl StatusCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let status: TunnelStatus = client.get("/v1/status", NO_QUERY).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&status),
            OutputFormat::Table => {
                println!("{}", "Tunnel".bold());
                println!("  ID:              {}", status.tunnel_id);
                println!("  State:           {}", colored_state(&status.state));
                println!(
                    "  Uptime:          {}",
                    display_option(&status.uptime_secs.map(format_uptime))
                );
                println!("  Restarts:        {}", status.restart_count);
                println!("  Failed checks:   {}", status.consecutive_failures);
                println!(
                    "  Last check:      {}",
                    display_option(&status.last_check.map(|t| t.to_rfc3339()))
                );
                println!("  Active routes:   {}", status.active_routes);
            }
        }

        Ok(())
    }
}

fn colored_state(state: &str) -> colored::ColoredString {
    match state {
        "up" => state.green(),
        "degraded" => state.yellow(),
        _ => state.red(),
    }
}

fn format_uptime(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
