//! Config command.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::output::{display_option, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Show or change saved settings.
#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    /// Show saved settings and the values in effect.
    Show,

    /// Save settings.
    Set(SetArgs),
}

#[derive(Debug, Args)]
struct SetArgs {
    /// Control plane API URL.
    #[arg(long = "url")]
    api_url: Option<String>,

    /// Workload to act as by default.
    #[arg(long = "as")]
    workload: Option<String>,
}

impl ConfigCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ConfigSubcommand::Show => show(&ctx),
            ConfigSubcommand::Set(args) => set(ctx, args),
        }
    }
}

fn show(ctx: &CommandContext) -> Result<()> {
    match ctx.format {
        OutputFormat::Json => print_single(&serde_json::json!({
            "saved": ctx.config,
            "effective": {
                "api_url": ctx.api_url,
                "workload": ctx.workload,
            },
        })),
        OutputFormat::Table => {
            println!("API URL:   {}", ctx.api_url);
            println!("Workload:  {}", display_option(&ctx.workload));
        }
    }
    Ok(())
}

fn set(ctx: CommandContext, args: SetArgs) -> Result<()> {
    if args.api_url.is_none() && args.workload.is_none() {
        anyhow::bail!("Nothing to set. Pass --url or --as.");
    }

    let mut config = ctx.config;
    if let Some(url) = args.api_url {
        config.api_url = Some(url);
    }
    if let Some(workload) = args.workload {
        config.workload = Some(workload);
    }

    let path = config.save()?;
    print_success(&format!("Saved settings to {}", path.display()));
    Ok(())
}
