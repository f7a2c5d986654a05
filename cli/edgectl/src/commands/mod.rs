//! CLI commands.

mod config;
mod routes;
mod status;
mod zones;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::config::Config;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Query string for calls that take none.
pub const NO_QUERY: &[(&str, &str)] = &[];

/// edgectl - route public hostnames through the tunnel.
#[derive(Debug, Parser)]
#[command(name = "edgectl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Control plane API URL.
    #[arg(long, global = true, env = "EDGECTL_API_URL")]
    api_url: Option<String>,

    /// Workload to act as.
    #[arg(long, global = true, env = "EDGECTL_WORKLOAD")]
    workload: Option<String>,

    /// Log requests to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show tunnel health.
    Status(status::StatusCommand),

    /// Request, list and delete public routes.
    Routes(routes::RoutesCommand),

    /// List domains available for routing.
    Zones(zones::ZonesCommand),

    /// Show or change saved settings.
    Config(config::ConfigCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        if self.verbose {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
                .with_writer(std::io::stderr)
                .init();
        }

        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let config = Config::load()?;
        let ctx = CommandContext {
            api_url: config.api_url(self.api_url.as_deref()),
            workload: config.workload(self.workload.as_deref()),
            config,
            format,
        };

        match self.command {
            Commands::Status(cmd) => cmd.run(ctx).await,
            Commands::Routes(cmd) => cmd.run(ctx).await,
            Commands::Zones(cmd) => cmd.run(ctx).await,
            Commands::Config(cmd) => cmd.run(ctx),
            Commands::Version => {
                println!("edgectl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
    pub api_url: String,
    pub workload: Option<String>,
}

impl CommandContext {
    /// API client speaking for the resolved workload.
    pub fn client(&self) -> Result<ApiClient> {
        let workload = self.workload.as_deref().ok_or(CliError::NoIdentity)?;
        tracing::debug!(api_url = %self.api_url, workload, "Building API client");
        ApiClient::new(&self.api_url, workload)
    }

    pub fn workload_name(&self) -> &str {
        self.workload.as_deref().unwrap_or("-")
    }
}
