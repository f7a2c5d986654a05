//! Routes command (public hostnames).

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{
    print_output, print_receipt, print_single, print_warning, NextStep, OutputFormat,
};

use super::CommandContext;

/// Routes command.
#[derive(Debug, Args)]
pub struct RoutesCommand {
    #[command(subcommand)]
    command: RoutesSubcommand,
}

#[derive(Debug, Subcommand)]
enum RoutesSubcommand {
    /// Publish a local port at <subdomain>.<domain>.
    Request(RequestRouteArgs),

    /// List routes you own.
    List(ListRoutesArgs),

    /// Remove a route.
    Delete(DeleteRouteArgs),
}

#[derive(Debug, Args)]
struct RequestRouteArgs {
    /// Leftmost hostname label.
    subdomain: String,

    /// Zone the hostname lives in.
    #[arg(long)]
    domain: String,

    /// Allocated port the service listens on.
    #[arg(long)]
    port: u16,

    /// Workload to own the route (operators only).
    #[arg(long)]
    owner: Option<String>,

    /// Act with operator privileges.
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[derive(Debug, Args)]
struct ListRoutesArgs {
    /// Only routes owned by this workload (operators only).
    #[arg(long = "owner")]
    workload: Option<String>,

    /// Only routes under this domain.
    #[arg(long)]
    domain: Option<String>,

    /// Act with operator privileges.
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[derive(Debug, Args)]
struct DeleteRouteArgs {
    /// Full hostname, or a subdomain together with --domain.
    hostname: String,

    #[arg(long)]
    domain: Option<String>,

    /// Act with operator privileges.
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct RouteResponse {
    #[tabled(rename = "Hostname")]
    hostname: String,

    #[tabled(skip)]
    subdomain: String,

    #[tabled(skip)]
    domain: String,

    #[tabled(rename = "URL")]
    public_url: String,

    #[tabled(rename = "Owner")]
    owning_workload: String,

    #[tabled(rename = "Port")]
    target_port: u16,

    #[tabled(skip)]
    target_kind: String,

    #[tabled(skip)]
    target_address: String,

    #[tabled(rename = "Target")]
    target: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Created")]
    created_at: DateTime<Utc>,

    #[tabled(skip)]
    deleted_at: Option<DateTime<Utc>>,

    /// Cleanup left to the operator, only set on deletes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[tabled(skip)]
    warnings: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListRoutesResponse {
    items: Vec<RouteResponse>,
}

#[derive(Debug, Serialize)]
struct CreateRouteRequest {
    subdomain: String,
    domain: String,
    target_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    owning_workload: Option<String>,
}

#[derive(Debug, Serialize)]
struct RouteQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    workload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    privileged: bool,
}

impl RoutesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            RoutesSubcommand::Request(args) => request_route(ctx, args).await,
            RoutesSubcommand::List(args) => list_routes(ctx, args).await,
            RoutesSubcommand::Delete(args) => delete_route(ctx, args).await,
        }
    }
}

async fn request_route(ctx: CommandContext, args: RequestRouteArgs) -> Result<()> {
    let client = ctx.client()?;

    let request = CreateRouteRequest {
        subdomain: args.subdomain,
        domain: args.domain,
        target_port: args.port,
        owning_workload: args.owner,
    };
    let query = RouteQuery {
        workload: None,
        domain: None,
        privileged: args.privileged,
    };

    let route: RouteResponse = client.post("/v1/routes", &query, &request).await?;

    let next = vec![
        NextStep {
            label: "Open",
            cmd: route.public_url.clone(),
        },
        NextStep {
            label: "Remove",
            cmd: format!(
                "edgectl --workload {} routes delete {}",
                ctx.workload_name(),
                route.hostname
            ),
        },
    ];

    print_receipt(
        ctx.format,
        &format!(
            "Routed {} -> {} (owner {})",
            route.public_url, route.target, route.owning_workload
        ),
        "routes.request",
        &route,
        &next,
    );
    Ok(())
}

async fn list_routes(ctx: CommandContext, args: ListRoutesArgs) -> Result<()> {
    let client = ctx.client()?;
    let query = RouteQuery {
        workload: args.workload.as_deref(),
        domain: args.domain.as_deref(),
        privileged: args.privileged,
    };

    let response: ListRoutesResponse = client.get("/v1/routes", &query).await?;

    match ctx.format {
        OutputFormat::Table => print_output(&response.items, ctx.format),
        OutputFormat::Json => print_single(&response),
    }

    Ok(())
}

async fn delete_route(ctx: CommandContext, args: DeleteRouteArgs) -> Result<()> {
    let client = ctx.client()?;
    let query = RouteQuery {
        workload: None,
        domain: args.domain.as_deref(),
        privileged: args.privileged,
    };

    let route: RouteResponse = client
        .delete(&format!("/v1/routes/{}", args.hostname), &query)
        .await
        .map_err(|e| match e {
            CliError::Api {
                status: 404,
                code,
                hint,
                retryable,
                ..
            } => CliError::Api {
                status: 404,
                code,
                message: format!("No route '{}' owned by {}", args.hostname, ctx.workload_name()),
                hint,
                retryable,
            },
            other => other,
        })?;

    if ctx.format == OutputFormat::Table {
        for warning in &route.warnings {
            print_warning(warning);
        }
    }

    print_receipt(
        ctx.format,
        &format!("Removed {}", route.hostname),
        "routes.delete",
        &route,
        &[],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_omits_defaults() {
        let query = RouteQuery {
            workload: None,
            domain: Some("example.com"),
            privileged: false,
        };
        let encoded = serde_json::to_value(&query).unwrap();
        assert_eq!(encoded, serde_json::json!({"domain": "example.com"}));

        let query = RouteQuery {
            workload: Some("teamA"),
            domain: None,
            privileged: true,
        };
        let encoded = serde_json::to_value(&query).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({"workload": "teamA", "privileged": true})
        );
    }

    #[test]
    fn test_route_response_parses_server_shape() {
        let route: RouteResponse = serde_json::from_value(serde_json::json!({
            "hostname": "api.example.com",
            "subdomain": "api",
            "domain": "example.com",
            "public_url": "https://api.example.com",
            "owning_workload": "teamA",
            "target_port": 5000,
            "target_kind": "host",
            "target_address": "localhost",
            "target": "host:localhost:5000",
            "status": "active",
            "created_at": "2026-01-01T00:00:00Z",
            "deleted_at": null
        }))
        .unwrap();
        assert_eq!(route.target, "host:localhost:5000");
        assert!(route.deleted_at.is_none());
        assert!(route.warnings.is_empty());
    }

    #[test]
    fn test_delete_response_carries_warnings() {
        let route: RouteResponse = serde_json::from_value(serde_json::json!({
            "hostname": "api.example.com",
            "subdomain": "api",
            "domain": "example.com",
            "public_url": "https://api.example.com",
            "owning_workload": "teamA",
            "target_port": 5000,
            "target_kind": "host",
            "target_address": "localhost:5000",
            "target": "host:localhost:5000",
            "status": "deleted",
            "created_at": "2026-01-01T00:00:00Z",
            "deleted_at": "2026-01-02T00:00:00Z",
            "warnings": ["DNS record left in place"]
        }))
        .unwrap();
        assert_eq!(route.warnings, ["DNS record left in place"]);
    }
}
