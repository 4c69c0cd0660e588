//! Demand commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{display_option, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Demand commands.
#[derive(Debug, Args)]
pub struct DemandCommand {
    #[command(subcommand)]
    command: DemandSubcommand,
}

#[derive(Debug, Subcommand)]
enum DemandSubcommand {
    /// List required capacity per label-set.
    List,

    /// Set required capacity for a label-set. A count of 0 removes it.
    Set(SetDemandArgs),
}

#[derive(Debug, Args)]
struct SetDemandArgs {
    /// Comma separated labels, e.g. `linux,gpu`. Empty matches every node.
    labels: String,

    /// Required node count.
    count: u32,
}

impl DemandCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            DemandSubcommand::List => list_demand(ctx).await,
            DemandSubcommand::Set(args) => set_demand(ctx, args).await,
        }
    }
}

/// Demand entry from the API.
#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct DemandResponse {
    #[tabled(rename = "Labels", display = "display_labels")]
    labels: Vec<String>,

    #[tabled(rename = "Required")]
    required: u32,

    #[tabled(rename = "Supplied")]
    supplied: u32,

    #[tabled(rename = "Queued")]
    queued: u32,

    #[tabled(rename = "Outstanding")]
    outstanding: u32,

    #[tabled(rename = "Unsatisfiable", display = "display_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unsatisfiable: Option<String>,

    #[tabled(rename = "Last Error", display = "display_option")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

fn display_labels(labels: &[String]) -> String {
    if labels.is_empty() {
        "*".to_string()
    } else {
        labels.join(",")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListDemandResponse {
    items: Vec<DemandResponse>,
}

#[derive(Debug, Serialize)]
struct SetDemandRequest {
    labels: Vec<String>,
    count: u32,
}

impl SetDemandRequest {
    fn from_args(args: &SetDemandArgs) -> Self {
        let labels = args
            .labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            labels,
            count: args.count,
        }
    }
}

async fn list_demand(ctx: CommandContext) -> Result<()> {
    let client = ctx.client()?;

    let response: ListDemandResponse = client.get("/v1/demand").await?;

    print_output(&response.items, ctx.format);
    Ok(())
}

async fn set_demand(ctx: CommandContext, args: SetDemandArgs) -> Result<()> {
    let client = ctx.client()?;
    let request = SetDemandRequest::from_args(&args);

    let response: Option<DemandResponse> = client.post("/v1/demand", &request).await?;

    match response {
        Some(entry) => print_single(&entry, ctx.format),
        None if ctx.format == OutputFormat::Json => println!("null"),
        None => print_success(&format!("Demand for '{}' removed", args.labels)),
    }
    Ok(())
}
