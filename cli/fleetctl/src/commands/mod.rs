//! CLI commands.

mod demand;
mod nodes;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::output::OutputFormat;

/// fleetctl - inspect and steer a fleet controller.
#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Base URL of the fleetd API.
    #[arg(
        long,
        global = true,
        env = "FLEET_URL",
        default_value = "http://127.0.0.1:8090"
    )]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inspect nodes and drive their lifecycle.
    Nodes(nodes::NodesCommand),

    /// Show or set required capacity.
    Demand(demand::DemandCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            url: self.url,
            format: self.format,
        };

        match self.command {
            Commands::Nodes(cmd) => cmd.run(ctx).await,
            Commands::Demand(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("fleetctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub url: String,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.url)
    }
}
