//! Node commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{display_option, print_info, print_output, print_single, OutputFormat};

use super::CommandContext;

/// Node commands.
#[derive(Debug, Args)]
pub struct NodesCommand {
    #[command(subcommand)]
    command: NodesSubcommand,
}

#[derive(Debug, Subcommand)]
enum NodesSubcommand {
    /// List all nodes in the fleet.
    List(ListNodesArgs),

    /// Get node details.
    Get(NodeArgs),

    /// Record scheduler activity on a node, postponing idle reclaim.
    Activity(NodeArgs),

    /// Reclaim a node on the next tick regardless of idle time.
    Reclaim(NodeArgs),

    /// Mark an idle node busy.
    Assign(NodeArgs),

    /// Mark a busy node idle again.
    Complete(NodeArgs),
}

#[derive(Debug, Args)]
struct ListNodesArgs {
    /// Only show nodes in this state (e.g. idle, busy, suspended).
    #[arg(long)]
    state: Option<String>,
}

#[derive(Debug, Args)]
struct NodeArgs {
    /// Node ID.
    node: String,
}

impl NodesCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            NodesSubcommand::List(args) => list_nodes(ctx, args).await,
            NodesSubcommand::Get(args) => get_node(ctx, args).await,
            NodesSubcommand::Activity(args) => node_action(ctx, args, "activity").await,
            NodesSubcommand::Reclaim(args) => node_action(ctx, args, "reclaim").await,
            NodesSubcommand::Assign(args) => node_action(ctx, args, "assign").await,
            NodesSubcommand::Complete(args) => node_action(ctx, args, "complete").await,
        }
    }
}

/// Node response from the API.
#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct NodeResponse {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Labels", display = "display_labels")]
    labels: Vec<String>,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Reclaim", display = "display_reclaim")]
    #[serde(flatten)]
    reclaim: ReclaimFlags,

    #[tabled(rename = "Last Activity", display = "display_time")]
    last_activity_at: DateTime<Utc>,

    #[tabled(rename = "Error", display = "display_option")]
    #[serde(default)]
    last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReclaimFlags {
    #[serde(default)]
    reclaim_requested: bool,
    #[serde(default)]
    reclaim_blocked: bool,
}

fn display_labels(labels: &[String]) -> String {
    if labels.is_empty() {
        "-".to_string()
    } else {
        labels.join(",")
    }
}

fn display_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn display_reclaim(flags: &ReclaimFlags) -> String {
    match (flags.reclaim_requested, flags.reclaim_blocked) {
        (_, true) => "blocked".to_string(),
        (true, false) => "requested".to_string(),
        (false, false) => "-".to_string(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListNodesResponse {
    items: Vec<NodeResponse>,
}

fn not_found(node: &str) -> impl FnOnce(CliError) -> CliError + '_ {
    move |e| match e {
        CliError::Api { status: 404, .. } => {
            CliError::NotFound(format!("Node '{}' not found", node))
        }
        other => other,
    }
}

async fn list_nodes(ctx: CommandContext, args: ListNodesArgs) -> Result<()> {
    let client = ctx.client()?;

    let mut response: ListNodesResponse = client.get("/v1/nodes").await?;
    if let Some(state) = args.state.as_deref() {
        response.items.retain(|n| n.state == state);
    }

    print_output(&response.items, ctx.format);
    Ok(())
}

async fn get_node(ctx: CommandContext, args: NodeArgs) -> Result<()> {
    let client = ctx.client()?;

    let response: NodeResponse = client
        .get(&format!("/v1/nodes/{}", args.node))
        .await
        .map_err(not_found(&args.node))?;

    print_single(&response, ctx.format);
    Ok(())
}

/// POST to a node action endpoint and print the updated node.
async fn node_action(ctx: CommandContext, args: NodeArgs, action: &str) -> Result<()> {
    let client = ctx.client()?;

    let response: NodeResponse = client
        .post_empty(&format!("/v1/nodes/{}/{}", args.node, action))
        .await
        .map_err(not_found(&args.node))?;

    if ctx.format == OutputFormat::Table && action == "reclaim" {
        print_info(&format!(
            "Reclaim of {} will start on the next controller tick",
            response.id
        ));
    }
    print_single(&response, ctx.format);
    Ok(())
}
