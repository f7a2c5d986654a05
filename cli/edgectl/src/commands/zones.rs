//! Zones command.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{print_output, print_single, OutputFormat};

use super::{CommandContext, NO_QUERY};

/// Zones command.
#[derive(Debug, Args)]
pub struct ZonesCommand {
    #[command(subcommand)]
    command: ZonesSubcommand,
}

#[derive(Debug, Subcommand)]
enum ZonesSubcommand {
    /// List domains the DNS provider account manages.
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct ZoneResponse {
    #[tabled(rename = "Domain")]
    domain: String,

    #[tabled(rename = "Zone ID")]
    provider_zone_id: String,

    #[tabled(rename = "Discovered")]
    discovered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListZonesResponse {
    items: Vec<ZoneResponse>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl ZonesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ZonesSubcommand::List => list_zones(ctx).await,
        }
    }
}

async fn list_zones(ctx: CommandContext) -> Result<()> {
    let client = ctx.client()?;
    let response: ListZonesResponse = client.get("/v1/zones", NO_QUERY).await?;

    match ctx.format {
        OutputFormat::Table => print_output(&response.items, ctx.format),
        OutputFormat::Json => print_single(&response),
    }

    Ok(())
}
