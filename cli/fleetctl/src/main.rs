//! fleetctl - CLI for the fleet controller
//!
//! Talks to a running fleetd over its HTTP API: inspect nodes, set demand,
//! and drive work assignment and reclaim by hand.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
