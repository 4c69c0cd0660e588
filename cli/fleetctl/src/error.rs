//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("API error: {detail}")]
    Api {
        status: u16,
        code: String,
        detail: String,
        retryable: bool,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn api(
        status: u16,
        code: impl Into<String>,
        detail: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Api {
            status,
            code: code.into(),
            detail: detail.into(),
            retryable,
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Api { code, .. } if code == "reclaim_pending" => {
                eprintln!(
                    "\n{}",
                    "Hint: The node is being reclaimed and cannot take new work.".yellow()
                );
            }
            CliError::Api { code, .. } if code == "invalid_state" => {
                eprintln!(
                    "\n{}",
                    "Hint: Check the node state with `fleetctl nodes get <node>`.".yellow()
                );
            }
            CliError::Api {
                retryable: true, ..
            } => {
                eprintln!("\n{}", "Hint: This error is transient; retry shortly.".yellow());
            }
            CliError::Network(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Is fleetd running? Check --url or FLEET_URL.".yellow()
                );
            }
            _ => {}
        }
    }
}
